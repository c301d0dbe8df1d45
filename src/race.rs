//! Race-to-submit coordinator.
//!
//! Each cycle, every pending applicant gets one race: one attempt per egress
//! path (the direct connection plus every active proxy), all launched at
//! once. The first terminal outcome aborts the rest of that race. Terminal
//! applicants are published on the signal channel so sibling workers stop
//! racing them, and attempts are throttled by a fleet-wide in-flight cap per
//! applicant.

use crate::applicant::{Applicant, IdentityKey};
use crate::artifacts::ArtifactWriter;
use crate::client::Submitter;
use crate::config::RaceConfig;
use crate::egress::Egress;
use crate::error::RaceError;
use crate::outcome::{Outcome, Submission};
use crate::pool::ProxyPool;
use crate::roster::RosterStore;
use crate::signal::TerminalSignalChannel;

use chrono::{DateTime, NaiveDate, Utc};
use futures::future;
use futures::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Poll interval while waiting for an in-flight slot.
const SLOT_POLL: Duration = Duration::from_millis(50);

/// One registration run for one date.
#[derive(Debug, Clone)]
pub struct RegistrationRun {
    pub target_date: NaiveDate,
    pub form_type: u32,
    pub roster: Vec<Applicant>,
    pub deadline: DateTime<Utc>,
}

/// Per-applicant state within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicantState {
    Pending,
    /// A race is running with this many attempts.
    Racing(usize),
    Succeeded,
    AlreadyRegistered,
    /// Another worker published a terminal outcome first.
    DecidedElsewhere,
    /// The deadline passed before a terminal outcome.
    Abandoned,
}

impl ApplicantState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ApplicantState::Succeeded | ApplicantState::AlreadyRegistered | ApplicantState::DecidedElsewhere
        )
    }
}

impl fmt::Display for ApplicantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicantState::Pending => f.write_str("pending"),
            ApplicantState::Racing(n) => write!(f, "racing({})", n),
            ApplicantState::Succeeded => f.write_str("success"),
            ApplicantState::AlreadyRegistered => f.write_str("already-registered"),
            ApplicantState::DecidedElsewhere => f.write_str("decided-elsewhere"),
            ApplicantState::Abandoned => f.write_str("abandoned"),
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    RosterEmpty,
    NoSlotsRemaining,
    Deadline,
    /// The attached pool has no active proxy left.
    ProxyPoolExhausted,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub applicant: Applicant,
    pub state: ApplicantState,
}

/// Result of [`RaceCoordinator::run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Applicants this worker registered.
    pub registered: Vec<Applicant>,
    /// Final state of every applicant in roster order.
    pub records: Vec<RunRecord>,
    pub stop_reason: StopReason,
    /// Submissions actually sent.
    pub attempts: usize,
    pub cycles: usize,
}

impl RunReport {
    pub fn state_of(&self, key: &IdentityKey) -> Option<ApplicantState> {
        self.records
            .iter()
            .find(|r| r.applicant.identity() == *key)
            .map(|r| r.state)
    }
}

enum RaceResult {
    Terminal(Submission),
    NoSlots,
    Decided,
    Unresolved,
}

enum AttemptResult {
    Submitted(Submission),
    Decided,
    NoSlot,
}

/// Everything an attempt task needs, shared by the attempts of one race.
struct AttemptContext {
    submitter: Arc<dyn Submitter>,
    signals: Arc<dyn TerminalSignalChannel>,
    applicant: Applicant,
    key: IdentityKey,
    date: NaiveDate,
    form_type: u32,
    cap: usize,
    slot_wait: Duration,
    attempt_timeout: Duration,
    attempts: Arc<AtomicUsize>,
    pool: Option<Arc<ProxyPool>>,
}

impl AttemptContext {
    async fn attempt(&self, egress: Egress) -> AttemptResult {
        let waited = tokio::time::Instant::now();
        let _lease = loop {
            if self.signals.is_decided(&self.key).await.unwrap_or(false) {
                return AttemptResult::Decided;
            }
            match self.signals.try_acquire(&self.key, self.cap).await {
                Ok(Some(lease)) => break Some(lease),
                Ok(None) => {
                    if waited.elapsed() >= self.slot_wait {
                        debug!("No in-flight slot for {} via {}", self.applicant.display_name(), egress);
                        return AttemptResult::NoSlot;
                    }
                    tokio::time::sleep(SLOT_POLL).await;
                }
                Err(e) => {
                    warn!("In-flight counter unavailable, attempting anyway: {}", e);
                    break None;
                }
            }
        };

        self.attempts.fetch_add(1, Ordering::SeqCst);
        let submit = self
            .submitter
            .submit(&self.applicant, self.date, self.form_type, &egress);
        match tokio::time::timeout(self.attempt_timeout, submit).await {
            Ok(submission) => {
                debug!(
                    "Attempt for {} via {}: {}",
                    self.applicant.display_name(),
                    egress,
                    submission.outcome
                );
                AttemptResult::Submitted(submission)
            }
            Err(_) => {
                debug!("Attempt for {} via {} timed out", self.applicant.display_name(), egress);
                if let (Some(pool), Some(url)) = (&self.pool, egress.proxy_url()) {
                    match self.submitter.target_url() {
                        Some(target) => pool.report_for_target(url, target, false, None),
                        None => pool.report(url, false, None),
                    }
                }
                AttemptResult::Submitted(Submission::bare(Outcome::TransientNetworkError))
            }
        }
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drives a [`RegistrationRun`] to completion.
pub struct RaceCoordinator {
    submitter: Arc<dyn Submitter>,
    signals: Arc<dyn TerminalSignalChannel>,
    config: RaceConfig,
    pool: Option<Arc<ProxyPool>>,
    roster_store: Option<Arc<dyn RosterStore>>,
    artifacts: Option<ArtifactWriter>,
}

impl RaceCoordinator {
    pub fn new(submitter: Arc<dyn Submitter>, signals: Arc<dyn TerminalSignalChannel>, config: RaceConfig) -> Self {
        Self {
            submitter,
            signals,
            config,
            pool: None,
            roster_store: None,
            artifacts: None,
        }
    }

    /// Race through the pool's proxies as well as the direct path.
    pub fn with_pool(mut self, pool: Arc<ProxyPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Remove terminal applicants from this durable roster.
    pub fn with_roster_store(mut self, store: Arc<dyn RosterStore>) -> Self {
        self.roster_store = Some(store);
        self
    }

    /// Save terminal response pages and the run summary.
    pub fn with_artifacts(mut self, artifacts: ArtifactWriter) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Run until the roster is empty, the date runs out of slots or the
    /// deadline passes.
    ///
    /// Fails with [`RaceError::ProxyPoolExhausted`] when a pool is attached
    /// and has no active proxy left. The error carries the partial report and
    /// the summary is written either way.
    pub async fn run(&self, run: RegistrationRun) -> Result<RunReport, RaceError> {
        let mut records: Vec<RunRecord> = run
            .roster
            .iter()
            .map(|applicant| RunRecord {
                applicant: applicant.clone(),
                state: ApplicantState::Pending,
            })
            .collect();
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut cycles = 0;

        let decided_elsewhere: Arc<Mutex<HashSet<IdentityKey>>> = Arc::default();
        let _watcher = {
            let decided = Arc::clone(&decided_elsewhere);
            let mut keys = self.signals.subscribe();
            AbortOnDrop(tokio::spawn(async move {
                while let Some(key) = keys.next().await {
                    decided.lock().insert(key);
                }
            }))
        };

        let (stop_tx, stop_rx) = watch::channel(false);

        let stop_reason = loop {
            if Utc::now() >= run.deadline {
                break StopReason::Deadline;
            }
            if self.pool_exhausted() {
                warn!("Proxy pool has no active proxy left");
                break StopReason::ProxyPoolExhausted;
            }

            {
                let decided = decided_elsewhere.lock();
                for record in records.iter_mut() {
                    if record.state == ApplicantState::Pending && decided.contains(&record.applicant.identity()) {
                        info!("{} was decided by another worker", record.applicant.display_name());
                        record.state = ApplicantState::DecidedElsewhere;
                    }
                }
            }

            let mut pending: Vec<usize> = (0..records.len())
                .filter(|&i| records[i].state == ApplicantState::Pending)
                .collect();
            if pending.is_empty() {
                break StopReason::RosterEmpty;
            }
            cycles += 1;

            if self.config.check_availability {
                let egress = self.probe_egress();
                match self
                    .submitter
                    .check_availability(run.target_date, run.form_type, &egress)
                    .await
                {
                    Some(0) if records.iter().any(|r| r.state == ApplicantState::Succeeded) => {
                        info!("No slots left for {}", run.target_date);
                        break StopReason::NoSlotsRemaining;
                    }
                    Some(0) => {
                        debug!("No slots open for {} yet", run.target_date);
                        self.pause(run.deadline).await;
                        continue;
                    }
                    Some(n) => debug!("{} slots left for {}", n, run.target_date),
                    None => debug!("Slot count for {} unknown", run.target_date),
                }
            }

            if self.config.shuffle {
                pending.shuffle(&mut rand::rng());
            }
            let egresses = self.egress_paths();
            info!(
                "Cycle {}: racing {} applicants over {} egress paths",
                cycles,
                pending.len(),
                egresses.len()
            );

            for &i in &pending {
                records[i].state = ApplicantState::Racing(egresses.len());
            }
            let races = pending.iter().map(|&i| {
                let applicant = records[i].applicant.clone();
                let attempts = Arc::clone(&attempts);
                let stop_rx = stop_rx.clone();
                let stop_tx = &stop_tx;
                let run = &run;
                let egresses = &egresses;
                async move {
                    let result = self.race(run, applicant, egresses, attempts, stop_rx).await;
                    if matches!(result, RaceResult::NoSlots) {
                        stop_tx.send_replace(true);
                    }
                    (i, result)
                }
            });
            let results = future::join_all(races).await;

            let mut out_of_slots = false;
            for (i, result) in results {
                records[i].state = match result {
                    RaceResult::Terminal(submission) if submission.outcome == Outcome::Success => {
                        ApplicantState::Succeeded
                    }
                    RaceResult::Terminal(_) => ApplicantState::AlreadyRegistered,
                    RaceResult::Decided => ApplicantState::DecidedElsewhere,
                    RaceResult::NoSlots => {
                        out_of_slots = true;
                        ApplicantState::Pending
                    }
                    RaceResult::Unresolved => ApplicantState::Pending,
                };
            }
            if out_of_slots {
                info!("Booking site reports no slots left for {}", run.target_date);
                break StopReason::NoSlotsRemaining;
            }

            self.pause(run.deadline).await;
        };

        if stop_reason == StopReason::Deadline {
            for record in records.iter_mut() {
                if matches!(record.state, ApplicantState::Pending | ApplicantState::Racing(_)) {
                    record.state = ApplicantState::Abandoned;
                }
            }
        }

        let report = RunReport {
            registered: records
                .iter()
                .filter(|r| r.state == ApplicantState::Succeeded)
                .map(|r| r.applicant.clone())
                .collect(),
            records,
            stop_reason,
            attempts: attempts.load(Ordering::SeqCst),
            cycles,
        };
        info!(
            "Run for {} stopped ({:?}): {} registered, {} attempts over {} cycles",
            run.target_date,
            report.stop_reason,
            report.registered.len(),
            report.attempts,
            report.cycles
        );
        self.write_summary(&report).await;
        if report.stop_reason == StopReason::ProxyPoolExhausted {
            return Err(RaceError::ProxyPoolExhausted {
                report: Box::new(report),
            });
        }
        Ok(report)
    }

    fn pool_exhausted(&self) -> bool {
        self.pool.as_ref().is_some_and(|pool| pool.get_stats().active == 0)
    }

    /// Direct path first, then the pool's proxies best first.
    fn egress_paths(&self) -> Vec<Egress> {
        let mut paths = vec![Egress::Direct];
        if let Some(pool) = &self.pool {
            let mut ranked = pool.ranked_proxies(self.submitter.target_url());
            if let Some(max) = self.config.max_proxies_per_race {
                ranked.truncate(max);
            }
            paths.extend(ranked.into_iter().map(Egress::Via));
        }
        paths
    }

    fn probe_egress(&self) -> Egress {
        self.pool
            .as_ref()
            .and_then(|pool| pool.best_proxy(self.submitter.target_url()).ok())
            .map(Egress::Via)
            .unwrap_or(Egress::Direct)
    }

    async fn pause(&self, deadline: DateTime<Utc>) {
        let left = (deadline - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(self.config.cycle_period.min(left)).await;
    }

    async fn race(
        &self,
        run: &RegistrationRun,
        applicant: Applicant,
        egresses: &[Egress],
        attempts: Arc<AtomicUsize>,
        mut stop: watch::Receiver<bool>,
    ) -> RaceResult {
        let key = applicant.identity();
        let ctx = Arc::new(AttemptContext {
            submitter: Arc::clone(&self.submitter),
            signals: Arc::clone(&self.signals),
            applicant,
            key,
            date: run.target_date,
            form_type: run.form_type,
            cap: self.config.in_flight_cap,
            slot_wait: self.config.slot_wait,
            attempt_timeout: self.config.attempt_timeout,
            attempts,
            pool: self.pool.clone(),
        });

        let mut set = JoinSet::new();
        for egress in egresses.iter().cloned() {
            let ctx = Arc::clone(&ctx);
            set.spawn(async move { ctx.attempt(egress).await });
        }

        let left = (run.deadline - Utc::now()).to_std().unwrap_or_default();
        let timer = tokio::time::sleep(self.config.race_timeout.min(left));
        tokio::pin!(timer);
        let mut decided = false;

        let result = loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break if decided { RaceResult::Decided } else { RaceResult::Unresolved },
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => error!("Attempt task for {} failed: {}", ctx.applicant.display_name(), e),
                    Some(Ok(AttemptResult::Submitted(submission))) => {
                        if submission.outcome.is_terminal() {
                            set.abort_all();
                            break RaceResult::Terminal(submission);
                        }
                        if submission.outcome == Outcome::NoSlotsRemaining {
                            set.abort_all();
                            break RaceResult::NoSlots;
                        }
                    }
                    Some(Ok(AttemptResult::Decided)) => decided = true,
                    Some(Ok(AttemptResult::NoSlot)) => {}
                },
                _ = &mut timer => {
                    set.abort_all();
                    debug!("Race for {} timed out", ctx.applicant.display_name());
                    break RaceResult::Unresolved;
                }
                _ = stop.wait_for(|stopped| *stopped) => {
                    set.abort_all();
                    break RaceResult::Unresolved;
                }
            }
        };

        if let RaceResult::Terminal(submission) = &result {
            self.settle(run.target_date, &ctx.applicant, &ctx.key, submission).await;
        }
        result
    }

    /// Act on a terminal outcome: drop from the durable roster, save the
    /// page, tell the other workers.
    async fn settle(&self, date: NaiveDate, applicant: &Applicant, key: &IdentityKey, submission: &Submission) {
        info!("{}: {}", applicant.display_name(), submission.outcome);

        if let Some(store) = &self.roster_store {
            match store.remove(date, key).await {
                Ok(true) => {}
                Ok(false) => debug!("{} was not in the durable roster", applicant.display_name()),
                Err(e) => warn!("Failed to remove {} from roster: {}", applicant.display_name(), e),
            }
        }

        if let (Some(artifacts), Some(body)) = (&self.artifacts, &submission.body) {
            if let Err(e) = artifacts.write_response(applicant, submission.outcome, body).await {
                warn!("Failed to save response for {}: {}", applicant.display_name(), e);
            }
        }

        if let Err(e) = self.signals.publish(key).await {
            warn!("Failed to publish {}: {}", key, e);
        }
    }

    async fn write_summary(&self, report: &RunReport) {
        let Some(artifacts) = &self.artifacts else {
            return;
        };
        let rows: Vec<(Applicant, String)> = report
            .records
            .iter()
            .filter(|r| matches!(r.state, ApplicantState::Succeeded | ApplicantState::AlreadyRegistered))
            .map(|r| (r.applicant.clone(), r.state.to_string()))
            .collect();
        if rows.is_empty() {
            return;
        }
        match artifacts.write_summary(rows).await {
            Ok(path) => info!("Summary written to {}", path.display()),
            Err(e) => warn!("Failed to write summary: {}", e),
        }
    }
}
