use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use slot_racer::error::RosterError;
use slot_racer::{
    Applicant, ApplicantState, ArtifactWriter, Egress, IdentityKey, MemoryRoster, MemorySignalChannel, Outcome,
    ProxyPool, ProxyPoolConfig, RaceConfig, RaceCoordinator, RaceError, RawApplicant, RegistrationRun, RosterStore,
    StopReason, Submission, Submitter, TerminalSignalChannel,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Script = Box<dyn Fn(&Applicant, &Egress) -> (Duration, Outcome) + Send + Sync>;

/// Submitter answering from a script after a delay, counting attempts that
/// finish and attempts that are dropped mid-flight.
struct ScriptedSubmitter {
    script: Script,
    slots: Mutex<VecDeque<u32>>,
    slots_after: Option<u32>,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedSubmitter {
    fn new(script: impl Fn(&Applicant, &Egress) -> (Duration, Outcome) + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            slots: Mutex::new(VecDeque::new()),
            slots_after: None,
            completed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    fn with_slots(mut self, slots: &[u32], then: Option<u32>) -> Self {
        self.slots = Mutex::new(slots.iter().copied().collect());
        self.slots_after = then;
        self
    }
}

struct InFlight<'a> {
    submitter: &'a ScriptedSubmitter,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.submitter.running.fetch_sub(1, Ordering::SeqCst);
        if !self.finished {
            self.submitter.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn page(outcome: Outcome) -> String {
    match outcome {
        Outcome::Success => "<p>Felicitări!</p>".to_string(),
        Outcome::AlreadyRegistered => {
            "<p class=\"alert alert-danger\">Deja a fost înregistrată o programare</p>".to_string()
        }
        Outcome::NoSlotsRemaining => "<p class=\"alert alert-danger\">NU mai este loc</p>".to_string(),
        _ => "<h1>Bad Gateway</h1>".to_string(),
    }
}

#[async_trait]
impl Submitter for ScriptedSubmitter {
    async fn submit(&self, applicant: &Applicant, _date: NaiveDate, _form_type: u32, egress: &Egress) -> Submission {
        let (delay, outcome) = (self.script)(applicant, egress);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let mut guard = InFlight {
            submitter: self,
            finished: false,
        };

        tokio::time::sleep(delay).await;
        guard.finished = true;
        self.completed.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Outcome::TransientNetworkError => Submission::bare(outcome),
            _ => Submission {
                outcome,
                body: Some(page(outcome)),
            },
        }
    }

    async fn check_availability(&self, _date: NaiveDate, _form_type: u32, _egress: &Egress) -> Option<u32> {
        self.slots.lock().pop_front().or(self.slots_after)
    }
}

/// Counts successful removals on top of a memory roster.
#[derive(Default)]
struct CountingRoster {
    inner: MemoryRoster,
    removed: AtomicUsize,
}

#[async_trait]
impl RosterStore for CountingRoster {
    async fn get_by_date(&self, date: NaiveDate) -> Result<Vec<Applicant>, RosterError> {
        self.inner.get_by_date(date).await
    }

    async fn add(&self, date: NaiveDate, applicant: &Applicant) -> Result<bool, RosterError> {
        self.inner.add(date, applicant).await
    }

    async fn remove(&self, date: NaiveDate, key: &IdentityKey) -> Result<bool, RosterError> {
        let removed = self.inner.remove(date, key).await?;
        if removed {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn reconcile(&self, date: NaiveDate, applicants: &[Applicant]) -> Result<(usize, usize), RosterError> {
        self.inner.reconcile(date, applicants).await
    }
}

const PROXY_A: &str = "http://10.0.0.1:80";
const PROXY_B: &str = "http://10.0.0.2:80";

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 2, 19).unwrap()
}

fn applicant(surname: &str) -> Applicant {
    Applicant::normalize(RawApplicant {
        surname: surname.into(),
        given_name: "Ana".into(),
        birth_date: "01.05.1990".into(),
        birthplace: "Cluj".into(),
        mother_name: "Ioana".into(),
        father_name: "Mihai".into(),
        email: format!("{}@example.com", surname.to_lowercase()),
        passport_number: "X123".into(),
    })
    .unwrap()
}

fn pool_with_two_proxies() -> Arc<ProxyPool> {
    let pool = ProxyPool::with_config(ProxyPoolConfig::builder().build()).unwrap();
    assert_eq!(pool.admit_trusted([PROXY_A, PROXY_B]), 2);
    pool
}

fn config() -> RaceConfig {
    RaceConfig::builder()
        .cycle_period(Duration::from_millis(50))
        .race_timeout(Duration::from_secs(3))
        .attempt_timeout(Duration::from_secs(10))
        .check_availability(false)
        .build()
}

fn run_for(roster: Vec<Applicant>, within: chrono::Duration) -> RegistrationRun {
    RegistrationRun {
        target_date: date(),
        form_type: 4,
        roster,
        deadline: Utc::now() + within,
    }
}

#[tokio::test]
async fn first_success_cancels_the_other_attempts() {
    init_logger();
    let submitter = Arc::new(ScriptedSubmitter::new(|_, egress| match egress.proxy_url() {
        Some(PROXY_A) => (Duration::from_millis(100), Outcome::Success),
        _ => (Duration::from_secs(5), Outcome::TransientNetworkError),
    }));
    let signals = Arc::new(MemorySignalChannel::new());
    let roster = Arc::new(MemoryRoster::new());
    let pop = applicant("POP");
    roster.add(date(), &pop).await.unwrap();

    let coordinator = RaceCoordinator::new(submitter.clone(), signals.clone(), config())
        .with_pool(pool_with_two_proxies())
        .with_roster_store(roster.clone());

    let started = Instant::now();
    let report = coordinator
        .run(run_for(vec![pop.clone()], chrono::Duration::seconds(10)))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(report.stop_reason, StopReason::RosterEmpty);
    assert_eq!(report.state_of(&pop.identity()), Some(ApplicantState::Succeeded));
    assert_eq!(report.registered, vec![pop.clone()]);
    assert_eq!(report.attempts, 3);

    // aborted tasks are dropped on the next scheduler pass
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(submitter.completed.load(Ordering::SeqCst), 1);
    assert_eq!(submitter.cancelled.load(Ordering::SeqCst), 2);
    assert_eq!(signals.in_flight(&pop.identity()), 0);

    assert!(signals.is_decided(&pop.identity()).await.unwrap());
    assert!(roster.get_by_date(date()).await.unwrap().is_empty());
}

#[tokio::test]
async fn sibling_coordinator_stops_racing_a_decided_applicant() {
    init_logger();
    let signals = Arc::new(MemorySignalChannel::new());
    let pop = applicant("POP");

    let winner = RaceCoordinator::new(
        Arc::new(ScriptedSubmitter::new(|_, _| (Duration::from_millis(50), Outcome::Success))),
        signals.clone(),
        config(),
    );
    let loser_submitter = Arc::new(ScriptedSubmitter::new(|_, _| {
        (Duration::from_millis(30), Outcome::TransientNetworkError)
    }));
    let loser = RaceCoordinator::new(loser_submitter.clone(), signals.clone(), config());

    let started = Instant::now();
    let (won, lost) = tokio::join!(
        winner.run(run_for(vec![pop.clone()], chrono::Duration::seconds(5))),
        loser.run(run_for(vec![pop.clone()], chrono::Duration::seconds(5))),
    );
    let (won, lost) = (won.unwrap(), lost.unwrap());

    assert_eq!(won.state_of(&pop.identity()), Some(ApplicantState::Succeeded));
    assert_eq!(lost.state_of(&pop.identity()), Some(ApplicantState::DecidedElsewhere));
    assert_eq!(lost.stop_reason, StopReason::RosterEmpty);
    assert!(lost.registered.is_empty());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(loser_submitter.completed.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn already_registered_is_settled_exactly_once() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let submitter = Arc::new(ScriptedSubmitter::new(|_, egress| {
        let delay = match egress.proxy_url() {
            None => 10,
            Some(PROXY_A) => 15,
            Some(_) => 20,
        };
        (Duration::from_millis(delay), Outcome::AlreadyRegistered)
    }));
    let roster = Arc::new(CountingRoster::default());
    let pop = applicant("POP");
    let ion = applicant("ION");
    roster.reconcile(date(), &[pop.clone(), ion.clone()]).await.unwrap();

    let coordinator = RaceCoordinator::new(submitter, Arc::new(MemorySignalChannel::new()), config())
        .with_pool(pool_with_two_proxies())
        .with_roster_store(roster.clone())
        .with_artifacts(ArtifactWriter::new(dir.path()));

    let report = coordinator
        .run(run_for(vec![pop.clone()], chrono::Duration::seconds(10)))
        .await
        .unwrap();

    assert_eq!(report.state_of(&pop.identity()), Some(ApplicantState::AlreadyRegistered));
    assert!(report.registered.is_empty());
    assert_eq!(report.stop_reason, StopReason::RosterEmpty);
    assert_eq!(roster.removed.load(Ordering::SeqCst), 1);
    assert_eq!(roster.get_by_date(date()).await.unwrap(), vec![ion]);

    assert!(dir.path().join("already-ANA_POP.html").exists());
    let summary = std::fs::read_to_string(dir.path().join("successfully-registered.csv")).unwrap();
    assert!(summary.contains("POP,ANA,1990-05-01"));
}

#[tokio::test]
async fn past_deadline_abandons_everyone_without_attempts() {
    init_logger();
    let submitter = Arc::new(ScriptedSubmitter::new(|_, _| (Duration::ZERO, Outcome::Success)));
    let coordinator = RaceCoordinator::new(submitter.clone(), Arc::new(MemorySignalChannel::new()), config());
    let roster = vec![applicant("POP"), applicant("ION")];

    let report = coordinator
        .run(run_for(roster, chrono::Duration::seconds(-1)))
        .await
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::Deadline);
    assert_eq!(report.attempts, 0);
    assert_eq!(report.cycles, 0);
    assert!(report.records.iter().all(|r| r.state == ApplicantState::Abandoned));
    assert_eq!(submitter.completed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn zero_slots_after_a_success_ends_the_run() {
    init_logger();
    let pop = applicant("POP");
    let ion = applicant("ION");
    let winner = pop.identity();
    let submitter = Arc::new(
        ScriptedSubmitter::new(move |a, _| {
            if a.identity() == winner {
                (Duration::from_millis(10), Outcome::Success)
            } else {
                (Duration::from_millis(10), Outcome::TransientNetworkError)
            }
        })
        .with_slots(&[3], Some(0)),
    );
    let config = RaceConfig::builder().cycle_period(Duration::from_millis(50)).build();
    let coordinator = RaceCoordinator::new(submitter, Arc::new(MemorySignalChannel::new()), config);

    let report = coordinator
        .run(run_for(vec![pop.clone(), ion.clone()], chrono::Duration::seconds(10)))
        .await
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::NoSlotsRemaining);
    assert_eq!(report.cycles, 2);
    assert_eq!(report.attempts, 2);
    assert_eq!(report.state_of(&pop.identity()), Some(ApplicantState::Succeeded));
    assert_eq!(report.state_of(&ion.identity()), Some(ApplicantState::Pending));
}

#[tokio::test]
async fn closed_window_is_polled_but_never_raced() {
    init_logger();
    let submitter = Arc::new(
        ScriptedSubmitter::new(|_, _| (Duration::ZERO, Outcome::Success)).with_slots(&[], Some(0)),
    );
    let config = RaceConfig::builder().cycle_period(Duration::from_millis(50)).build();
    let coordinator = RaceCoordinator::new(submitter, Arc::new(MemorySignalChannel::new()), config);

    let report = coordinator
        .run(run_for(vec![applicant("POP")], chrono::Duration::milliseconds(300)))
        .await
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::Deadline);
    assert_eq!(report.attempts, 0);
    assert!(report.cycles >= 2);
    assert_eq!(report.records[0].state, ApplicantState::Abandoned);
}

#[tokio::test]
async fn no_slots_answer_stops_every_race() {
    init_logger();
    let pop = applicant("POP");
    let full = pop.identity();
    let submitter = Arc::new(ScriptedSubmitter::new(move |a, _| {
        if a.identity() == full {
            (Duration::from_millis(20), Outcome::NoSlotsRemaining)
        } else {
            (Duration::from_secs(5), Outcome::TransientNetworkError)
        }
    }));
    let coordinator = RaceCoordinator::new(submitter.clone(), Arc::new(MemorySignalChannel::new()), config());

    let started = Instant::now();
    let report = coordinator
        .run(run_for(vec![pop, applicant("ION")], chrono::Duration::seconds(10)))
        .await
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::NoSlotsRemaining);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(report.registered.is_empty());
}

#[tokio::test]
async fn in_flight_cap_bounds_concurrent_attempts() {
    init_logger();
    let submitter = Arc::new(ScriptedSubmitter::new(|_, _| {
        (Duration::from_millis(200), Outcome::TransientNetworkError)
    }));
    let config = RaceConfig::builder()
        .cycle_period(Duration::from_millis(50))
        .in_flight_cap(1)
        .slot_wait(Duration::from_millis(50))
        .check_availability(false)
        .build();
    let coordinator = RaceCoordinator::new(submitter.clone(), Arc::new(MemorySignalChannel::new()), config)
        .with_pool(pool_with_two_proxies());

    let report = coordinator
        .run(run_for(vec![applicant("POP")], chrono::Duration::milliseconds(600)))
        .await
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::Deadline);
    assert!(report.attempts >= 1);
    assert_eq!(submitter.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhausted_pool_aborts_the_run() {
    init_logger();
    let pool = ProxyPool::with_config(ProxyPoolConfig::builder().build()).unwrap();
    let submitter = Arc::new(ScriptedSubmitter::new(|_, _| (Duration::ZERO, Outcome::Success)));
    let coordinator =
        RaceCoordinator::new(submitter, Arc::new(MemorySignalChannel::new()), config()).with_pool(pool);

    let result = coordinator
        .run(run_for(vec![applicant("POP")], chrono::Duration::seconds(10)))
        .await;
    let Err(RaceError::ProxyPoolExhausted { report }) = result else {
        panic!("expected an exhausted pool");
    };
    assert_eq!(report.stop_reason, StopReason::ProxyPoolExhausted);
    assert_eq!(report.attempts, 0);
    assert_eq!(report.records[0].state, ApplicantState::Pending);
}

#[tokio::test]
async fn pool_running_dry_keeps_what_was_settled() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let pool = ProxyPool::with_config(ProxyPoolConfig::builder().build()).unwrap();
    assert_eq!(pool.admit_trusted([PROXY_A]), 1);

    let pop = applicant("POP");
    let ion = applicant("ION");
    let winner = pop.identity();
    let reporter = Arc::clone(&pool);
    let submitter = Arc::new(ScriptedSubmitter::new(move |a, _| {
        if a.identity() == winner {
            (Duration::from_millis(10), Outcome::Success)
        } else {
            for _ in 0..40 {
                reporter.report(PROXY_A, false, None);
            }
            (Duration::from_millis(10), Outcome::TransientNetworkError)
        }
    }));
    let coordinator = RaceCoordinator::new(submitter, Arc::new(MemorySignalChannel::new()), config())
        .with_pool(pool)
        .with_artifacts(ArtifactWriter::new(dir.path()));

    let result = coordinator
        .run(run_for(vec![pop.clone(), ion.clone()], chrono::Duration::seconds(10)))
        .await;
    let Err(RaceError::ProxyPoolExhausted { report }) = result else {
        panic!("expected an exhausted pool");
    };

    assert_eq!(report.cycles, 1);
    assert_eq!(report.registered, vec![pop.clone()]);
    assert_eq!(report.state_of(&pop.identity()), Some(ApplicantState::Succeeded));
    assert_eq!(report.state_of(&ion.identity()), Some(ApplicantState::Pending));

    assert!(dir.path().join("success-ANA_POP.html").exists());
    let summary = std::fs::read_to_string(dir.path().join("successfully-registered.csv")).unwrap();
    assert!(summary.contains("POP,ANA,1990-05-01"));
    assert!(!summary.contains("ION,"));
}

#[tokio::test]
async fn timed_out_attempts_count_against_their_proxy() {
    init_logger();
    let pool = ProxyPool::with_config(ProxyPoolConfig::builder().eviction_threshold(1).build()).unwrap();
    assert_eq!(pool.admit_trusted([PROXY_A, PROXY_B]), 2);

    let submitter = Arc::new(ScriptedSubmitter::new(|_, egress| match egress.proxy_url() {
        Some(PROXY_A) => (Duration::from_secs(5), Outcome::Success),
        _ => (Duration::from_millis(10), Outcome::TransientNetworkError),
    }));
    let config = RaceConfig::builder()
        .cycle_period(Duration::from_millis(50))
        .attempt_timeout(Duration::from_millis(100))
        .check_availability(false)
        .build();
    let coordinator = RaceCoordinator::new(submitter.clone(), Arc::new(MemorySignalChannel::new()), config)
        .with_pool(Arc::clone(&pool));

    let report = coordinator
        .run(run_for(vec![applicant("POP")], chrono::Duration::milliseconds(500)))
        .await
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::Deadline);
    assert!(report.registered.is_empty());
    let active: Vec<String> = pool.active_proxies().into_iter().map(|p| p.url).collect();
    assert_eq!(active, vec![PROXY_B.to_string()]);
    assert_eq!(pool.get_stats().evicted, 1);
}
