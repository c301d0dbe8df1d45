//! # slot-racer
//!
//! Races appointment submissions against a time-gated booking endpoint.
//!
//! The crate pairs an adaptive proxy pool (discovery, validation, scoring and
//! eviction of proxies, with a reqwest middleware on top) with a coordinator
//! that, for every applicant, fires one submission per egress path at once,
//! keeps the first terminal answer and cancels the rest. Workers in separate
//! processes share which applicants are settled and how many attempts are in
//! flight for each.

pub mod applicant;
pub mod artifacts;
pub mod captcha;
pub mod client;
pub mod config;
pub mod egress;
pub mod error;
pub mod middleware;
pub mod outcome;
pub mod pool;
pub mod proxy;
pub mod race;
pub mod roster;
pub mod scheduler;
pub mod signal;
pub mod sources;

pub use applicant::{Applicant, IdentityKey, RawApplicant};
pub use artifacts::ArtifactWriter;
pub use captcha::{CaptchaToken, CaptchaTokenSupplier, HttpTokenMinter, TokenMinter};
pub use client::{SubmissionClient, Submitter};
pub use config::{ProxyPoolConfig, ProxyPoolConfigBuilder, RaceConfig, RaceConfigBuilder, Settings};
pub use egress::Egress;
pub use error::{NoProxyAvailable, PoolError, RaceError};
pub use middleware::ProxyPoolMiddleware;
pub use outcome::{parse_outcome, Outcome, Submission};
pub use pool::{PoolStats, ProxyPool};
pub use proxy::{Proxy, ProxyState};
pub use race::{ApplicantState, RaceCoordinator, RegistrationRun, RunReport, StopReason};
pub use roster::{JsonFileRoster, MemoryRoster, RosterStore};
pub use scheduler::RunScheduler;
pub use signal::{FileSignalChannel, InFlightLease, MemorySignalChannel, TerminalSignalChannel};
pub use sources::ProxySource;
