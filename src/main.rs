use anyhow::{bail, Context};
use chrono::Datelike;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use slot_racer::{
    roster, ArtifactWriter, CaptchaTokenSupplier, FileSignalChannel, HttpTokenMinter, JsonFileRoster, PoolError,
    ProxyPool, RaceCoordinator, RaceError, RegistrationRun, RosterStore, RunScheduler, Settings, SubmissionClient,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const SIGNAL_POLL: Duration = Duration::from_millis(250);
const TOKEN_TIMEOUT: Duration = Duration::from_secs(60);
const REFILL_IDLE: Duration = Duration::from_millis(200);
const EXHAUSTED_BACKOFF: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "slot-racer", version, about = "Race appointment submissions for a roster of applicants")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the configured number of workers and supervise them until the stop time.
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Race the roster in this process.
    Worker {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, default_value_t = 0)]
        index: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Run { config } => {
            let settings = load(&config)?;
            if settings.workers <= 1 {
                return worker(settings, 0).await;
            }
            let scheduler = RunScheduler::new(settings.start_at, settings.stop_at);
            let statuses = scheduler.supervise(&config, settings.workers).await?;
            let failed = statuses.iter().filter(|s| !s.is_some_and(|s| s.success())).count();
            if failed > 0 {
                warn!("{} of {} workers did not exit cleanly", failed, statuses.len());
            }
            Ok(())
        }
        Command::Worker { config, index } => worker(load(&config)?, index).await,
    }
}

fn load(path: &Path) -> anyhow::Result<Settings> {
    Settings::load(path).with_context(|| format!("loading {}", path.display()))
}

async fn worker(settings: Settings, index: usize) -> anyhow::Result<()> {
    let date = settings.target_date;
    let scheduler = RunScheduler::new(settings.start_at, settings.stop_at);
    if scheduler.is_over() {
        bail!("stop time {} already passed", settings.stop_at);
    }

    let mut applicants = roster::load_csv(&settings.roster)?;
    info!("Worker {}: {} applicants loaded for {}", index, applicants.len(), date);

    let store: Option<Arc<dyn RosterStore>> = match &settings.roster_store {
        Some(path) => {
            let store: Arc<dyn RosterStore> = Arc::new(JsonFileRoster::new(path));
            store.reconcile(date, &applicants).await?;
            applicants = store.get_by_date(date).await?;
            Some(store)
        }
        None => None,
    };

    scheduler.wait_for_start().await;

    let pool = if settings.pool.enabled {
        match scheduler.run_until_stop(build_pool(&settings)).await {
            Some(pool) => Some(pool),
            None => bail!("no usable proxies before stop time"),
        }
    } else {
        None
    };

    let Some(token_url) = &settings.captcha.token_url else {
        bail!("captcha.token_url is not set");
    };
    let minter = Arc::new(HttpTokenMinter::new(token_url.clone(), TOKEN_TIMEOUT)?);
    let tokens = Arc::new(CaptchaTokenSupplier::new(
        minter,
        settings.captcha.buffer,
        settings.captcha.mint_concurrency,
        Duration::from_millis(settings.captcha.max_age_ms),
    ));
    let _refill = tokens.spawn_refill(REFILL_IDLE);

    let race_config = settings.race_config();
    let client = Arc::new(SubmissionClient::new(
        &settings.base_url,
        tokens,
        pool.clone(),
        race_config.attempt_timeout,
    )?);
    let _sweep = pool.as_ref().map(|pool| pool.spawn_sweep(client.submit_url().to_string()));

    match client.open_days(date.year(), date.month(), settings.form_type).await {
        Ok(days) if !days.contains(&date) => {
            warn!("{} is not offered for form {}, racing anyway", date, settings.form_type)
        }
        Ok(days) => info!("{} open days this month for form {}", days.len(), settings.form_type),
        Err(e) => warn!("Open days lookup failed: {}", e),
    }

    if settings.skip_registered {
        match client.registered_names(settings.form_type, date, date).await {
            Ok(names) => {
                let before = applicants.len();
                applicants.retain(|a| !names.contains(&(a.surname.clone(), a.given_name.clone())));
                info!("{} applicants already hold a booking", before - applicants.len());
            }
            Err(e) => warn!("Registrations lookup failed, racing everyone: {}", e),
        }
    }

    let artifacts_dir = settings.artifacts_dir();
    let signals = Arc::new(FileSignalChannel::new(
        artifacts_dir.join("signals"),
        race_config.lease_ttl(),
        SIGNAL_POLL,
    )?);
    let mut coordinator =
        RaceCoordinator::new(client, signals, race_config).with_artifacts(ArtifactWriter::new(&artifacts_dir));
    if let Some(pool) = &pool {
        coordinator = coordinator.with_pool(Arc::clone(pool));
    }
    if let Some(store) = store {
        coordinator = coordinator.with_roster_store(store);
    }

    let mut registered = 0;
    loop {
        let run = RegistrationRun {
            target_date: date,
            form_type: settings.form_type,
            roster: applicants.clone(),
            deadline: settings.stop_at,
        };
        match coordinator.run(run).await {
            Ok(report) => {
                info!(
                    "Worker {} done: {} registered ({:?})",
                    index,
                    registered + report.registered.len(),
                    report.stop_reason
                );
                return Ok(());
            }
            Err(RaceError::ProxyPoolExhausted { report }) => {
                registered += report.registered.len();
                applicants.retain(|a| !report.state_of(&a.identity()).is_some_and(|s| s.is_terminal()));
                if scheduler.is_over() {
                    bail!("proxy pool exhausted and stop time reached, {} registered", registered);
                }
                warn!("Proxy pool exhausted, backing off {:?}", EXHAUSTED_BACKOFF);
                tokio::time::sleep(EXHAUSTED_BACKOFF).await;
                if let Some(pool) = &pool {
                    pool.refresh_sources().await;
                }
            }
        }
    }
}

/// Build the pool, retrying with a backoff while discovery finds nothing.
async fn build_pool(settings: &Settings) -> Arc<ProxyPool> {
    loop {
        match ProxyPool::new(settings.pool_config()).await {
            Ok(pool) => return pool,
            Err(PoolError::Exhausted { candidates }) => {
                warn!("No proxy out of {} candidates is usable, retrying", candidates);
            }
            Err(e) => error!("Proxy pool failed to start: {}", e),
        }
        tokio::time::sleep(EXHAUSTED_BACKOFF).await;
    }
}
