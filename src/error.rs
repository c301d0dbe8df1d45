//! Error types for the slot-racer crate.

use crate::race::RunReport;

use std::path::PathBuf;
use thiserror::Error;

/// Error returned when no active proxy is available in the pool.
#[derive(Debug, Error)]
#[error("No proxy available in pool")]
pub struct NoProxyAvailable;

/// Errors raised by the proxy pool itself.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Discovery finished but not a single proxy passed validation.
    #[error("proxy pool exhausted: 0 of {candidates} candidates passed validation")]
    Exhausted { candidates: usize },
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Errors raised while fetching a proxy source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to fetch proxy source: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to read proxy file {path}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unexpected proxy source payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Errors raised while minting captcha tokens.
#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token service returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("token service returned an empty token")]
    Empty,
}

/// Errors raised while normalizing applicant records.
#[derive(Debug, Error, PartialEq)]
pub enum ApplicantError {
    #[error("field `{0}` is empty")]
    MissingField(&'static str),
    #[error("unrecognized birth date `{0}`")]
    BirthDate(String),
}

/// Errors raised by roster persistence.
#[derive(Debug, Error)]
pub enum RosterError {
    #[error("roster io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("roster file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("roster csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid applicant in roster (row {row}): {source}")]
    Applicant { row: usize, source: ApplicantError },
    #[error("timed out waiting for roster lock {0}")]
    LockTimeout(PathBuf),
}

/// Errors raised by cross-process signal backends.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal store io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors that abort a registration run.
#[derive(Debug, Error)]
pub enum RaceError {
    /// Every proxy has been evicted or none was ever admitted. `report`
    /// holds what the run settled before the pool ran dry.
    #[error("proxy pool has no active proxies left")]
    ProxyPoolExhausted { report: Box<RunReport> },
}

/// Errors raised while loading the settings file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Errors raised while writing audit artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write summary: {0}")]
    Csv(#[from] csv::Error),
}
