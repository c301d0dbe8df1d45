//! Wall-clock start/stop and worker process fan-out.
//!
//! Workers are independent processes. Each one waits for the same start
//! instant on its own clock, so there is no barrier between them; the
//! supervisor only launches them and kills whatever is left at the stop
//! instant.

use chrono::{DateTime, Utc};
use futures::future;
use log::{info, warn};
use std::future::Future;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Start and stop instants of a run.
#[derive(Debug, Clone, Copy)]
pub struct RunScheduler {
    start_at: Option<DateTime<Utc>>,
    stop_at: DateTime<Utc>,
}

fn until(instant: DateTime<Utc>) -> Duration {
    (instant - Utc::now()).to_std().unwrap_or_default()
}

impl RunScheduler {
    /// Without `start_at` the run starts immediately.
    pub fn new(start_at: Option<DateTime<Utc>>, stop_at: DateTime<Utc>) -> Self {
        Self { start_at, stop_at }
    }

    pub fn stop_at(&self) -> DateTime<Utc> {
        self.stop_at
    }

    pub fn is_over(&self) -> bool {
        Utc::now() >= self.stop_at
    }

    /// Sleep until the start instant.
    pub async fn wait_for_start(&self) {
        let Some(start_at) = self.start_at else {
            return;
        };
        let wait = until(start_at);
        if !wait.is_zero() {
            info!("Waiting {:?} until start at {}", wait, start_at);
            tokio::time::sleep(wait).await;
        }
    }

    /// Drive `job` until it finishes or the stop instant passes.
    pub async fn run_until_stop<F: Future>(&self, job: F) -> Option<F::Output> {
        match tokio::time::timeout(until(self.stop_at), job).await {
            Ok(output) => Some(output),
            Err(_) => {
                warn!("Stop time {} reached", self.stop_at);
                None
            }
        }
    }

    /// Launch `workers` copies of this executable in worker mode and wait for
    /// them. Workers still running at the stop instant are killed.
    pub async fn supervise(&self, config: &Path, workers: usize) -> std::io::Result<Vec<Option<ExitStatus>>> {
        let exe = std::env::current_exe()?;
        let mut children: Vec<Child> = Vec::with_capacity(workers);
        for index in 0..workers {
            let child = Command::new(&exe)
                .arg("worker")
                .arg("--config")
                .arg(config)
                .arg("--index")
                .arg(index.to_string())
                .kill_on_drop(true)
                .spawn()?;
            info!("Started worker {} (pid {:?})", index, child.id());
            children.push(child);
        }

        // a grace period lets workers write their summaries
        let grace = Duration::from_secs(5);
        let deadline = tokio::time::Instant::now() + until(self.stop_at) + grace;

        let waits = children.iter_mut().enumerate().map(|(index, child)| async move {
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("Worker {} exited with {}", index, status);
                    Some(status)
                }
                Ok(Err(e)) => {
                    warn!("Failed to wait for worker {}: {}", index, e);
                    None
                }
                Err(_) => {
                    warn!("Killing worker {} at stop time", index);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill worker {}: {}", index, e);
                    }
                    None
                }
            }
        });
        Ok(future::join_all(waits).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn past_start_does_not_wait() {
        let now = Utc::now();
        let scheduler = RunScheduler::new(Some(now - chrono::Duration::seconds(5)), now + chrono::Duration::seconds(5));

        let started = std::time::Instant::now();
        scheduler.wait_for_start().await;
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!scheduler.is_over());
    }

    #[tokio::test]
    async fn waits_for_start_instant() {
        let now = Utc::now();
        let scheduler = RunScheduler::new(
            Some(now + chrono::Duration::milliseconds(150)),
            now + chrono::Duration::seconds(5),
        );

        let started = std::time::Instant::now();
        scheduler.wait_for_start().await;
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn job_is_cut_at_stop_instant() {
        let scheduler = RunScheduler::new(None, Utc::now() + chrono::Duration::milliseconds(100));

        let finished = scheduler.run_until_stop(async { 7 }).await;
        assert_eq!(finished, Some(7));

        let cut = scheduler
            .run_until_stop(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert!(cut.is_none());
    }
}
