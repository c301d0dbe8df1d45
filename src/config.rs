//! Configuration for the proxy pool, the race coordinator and the binary.

use crate::error::ConfigError;
use crate::sources::ProxySource;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIN_LEASE_TTL: Duration = Duration::from_secs(30);

/// Configuration for the proxy pool.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Sources to fetch proxy lists from.
    pub sources: Vec<ProxySource>,
    /// Proxies admitted as active without probing (e.g. a residential gateway).
    pub trusted: Vec<String>,
    /// Neutral IP-echo URL used to validate newly discovered proxies.
    pub validation_url: String,
    /// Timeout for one validation probe.
    pub validation_timeout: Duration,
    /// Maximum number of validation probes in flight at once.
    pub validation_concurrency: usize,
    /// Interval between source re-polls.
    pub discovery_interval: Duration,
    /// Interval between target-specific validation sweeps.
    pub sweep_interval: Duration,
    /// Timeout for one sweep probe against the target URL.
    pub sweep_timeout: Duration,
    /// Net failure count at which a proxy is evicted for good.
    pub eviction_threshold: u32,
    /// Number of times the middleware retries a request with different proxies.
    pub retry_count: usize,
    /// Maximum requests per second per proxy.
    pub max_requests_per_second: f64,
}

impl ProxyPoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ProxyPoolConfigBuilder {
        ProxyPoolConfigBuilder::new()
    }
}

/// Builder for `ProxyPoolConfig`.
pub struct ProxyPoolConfigBuilder {
    sources: Vec<ProxySource>,
    trusted: Vec<String>,
    validation_url: Option<String>,
    validation_timeout: Option<Duration>,
    validation_concurrency: Option<usize>,
    discovery_interval: Option<Duration>,
    sweep_interval: Option<Duration>,
    sweep_timeout: Option<Duration>,
    eviction_threshold: Option<u32>,
    retry_count: Option<usize>,
    max_requests_per_second: Option<f64>,
}

impl ProxyPoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            trusted: Vec::new(),
            validation_url: None,
            validation_timeout: None,
            validation_concurrency: None,
            discovery_interval: None,
            sweep_interval: None,
            sweep_timeout: None,
            eviction_threshold: None,
            retry_count: None,
            max_requests_per_second: None,
        }
    }

    /// Set the sources to fetch proxy lists from.
    pub fn sources(mut self, sources: Vec<ProxySource>) -> Self {
        self.sources = sources;
        self
    }

    /// Set proxies that skip validation.
    pub fn trusted(mut self, trusted: Vec<impl Into<String>>) -> Self {
        self.trusted = trusted.into_iter().map(Into::into).collect();
        self
    }

    /// Set the IP-echo URL used for validation probes.
    pub fn validation_url(mut self, url: impl Into<String>) -> Self {
        self.validation_url = Some(url.into());
        self
    }

    /// Set the timeout for validation probes.
    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = Some(timeout);
        self
    }

    /// Set the number of concurrent validation probes.
    pub fn validation_concurrency(mut self, n: usize) -> Self {
        self.validation_concurrency = Some(n);
        self
    }

    /// Set the interval between source re-polls.
    pub fn discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = Some(interval);
        self
    }

    /// Set the interval between target sweeps.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Set the timeout of a single sweep probe.
    pub fn sweep_timeout(mut self, timeout: Duration) -> Self {
        self.sweep_timeout = Some(timeout);
        self
    }

    /// Set the eviction threshold.
    pub fn eviction_threshold(mut self, threshold: u32) -> Self {
        self.eviction_threshold = Some(threshold);
        self
    }

    /// Set the number of times to retry a request with different proxies.
    pub fn retry_count(mut self, count: usize) -> Self {
        self.retry_count = Some(count);
        self
    }

    /// Set the maximum requests per second per proxy.
    pub fn max_requests_per_second(mut self, rps: f64) -> Self {
        self.max_requests_per_second = Some(rps);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProxyPoolConfig {
        ProxyPoolConfig {
            sources: self.sources,
            trusted: self.trusted,
            validation_url: self.validation_url.unwrap_or_else(|| "https://api.ipify.org".to_string()),
            validation_timeout: self.validation_timeout.unwrap_or(Duration::from_secs(5)),
            validation_concurrency: self.validation_concurrency.unwrap_or(256).max(1),
            discovery_interval: self.discovery_interval.unwrap_or(Duration::from_secs(600)),
            sweep_interval: self.sweep_interval.unwrap_or(Duration::from_secs(2)),
            sweep_timeout: self.sweep_timeout.unwrap_or(Duration::from_secs(4)),
            eviction_threshold: self.eviction_threshold.unwrap_or(30).max(1),
            retry_count: self.retry_count.unwrap_or(2),
            max_requests_per_second: self.max_requests_per_second.unwrap_or(5.0),
        }
    }
}

impl Default for ProxyPoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the race coordinator.
#[derive(Debug, Clone)]
pub struct RaceConfig {
    /// Sleep between cycles.
    pub cycle_period: Duration,
    /// Hard limit for one race (all attempts for one applicant in one cycle).
    pub race_timeout: Duration,
    /// Hard limit for a single submission attempt.
    pub attempt_timeout: Duration,
    /// Fleet-wide cap on concurrent attempts per applicant.
    pub in_flight_cap: usize,
    /// How long an attempt waits for an in-flight slot before giving up.
    pub slot_wait: Duration,
    /// Poll remaining slots before each cycle.
    pub check_availability: bool,
    /// Shuffle the pending applicants each cycle.
    pub shuffle: bool,
    /// Optional cap on proxy egress paths per race (the direct path is always added).
    pub max_proxies_per_race: Option<usize>,
}

impl RaceConfig {
    /// Create a new configuration builder.
    pub fn builder() -> RaceConfigBuilder {
        RaceConfigBuilder::default()
    }

    /// Age after which another process may sweep an in-flight lease.
    ///
    /// Twice `attempt_timeout`, and never under 30s.
    pub fn lease_ttl(&self) -> Duration {
        (self.attempt_timeout * 2).max(MIN_LEASE_TTL)
    }
}

impl Default for RaceConfig {
    fn default() -> Self {
        RaceConfig::builder().build()
    }
}

/// Builder for `RaceConfig`.
#[derive(Default)]
pub struct RaceConfigBuilder {
    cycle_period: Option<Duration>,
    race_timeout: Option<Duration>,
    attempt_timeout: Option<Duration>,
    in_flight_cap: Option<usize>,
    slot_wait: Option<Duration>,
    check_availability: Option<bool>,
    shuffle: Option<bool>,
    max_proxies_per_race: Option<usize>,
}

impl RaceConfigBuilder {
    pub fn cycle_period(mut self, period: Duration) -> Self {
        self.cycle_period = Some(period);
        self
    }

    pub fn race_timeout(mut self, timeout: Duration) -> Self {
        self.race_timeout = Some(timeout);
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn in_flight_cap(mut self, cap: usize) -> Self {
        self.in_flight_cap = Some(cap);
        self
    }

    pub fn slot_wait(mut self, wait: Duration) -> Self {
        self.slot_wait = Some(wait);
        self
    }

    pub fn check_availability(mut self, enabled: bool) -> Self {
        self.check_availability = Some(enabled);
        self
    }

    pub fn shuffle(mut self, enabled: bool) -> Self {
        self.shuffle = Some(enabled);
        self
    }

    pub fn max_proxies_per_race(mut self, max: usize) -> Self {
        self.max_proxies_per_race = Some(max);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RaceConfig {
        let race_timeout = self.race_timeout.unwrap_or(Duration::from_secs(8));
        RaceConfig {
            cycle_period: self.cycle_period.unwrap_or(Duration::from_secs(1)),
            race_timeout,
            attempt_timeout: self.attempt_timeout.unwrap_or(Duration::from_secs(6)),
            in_flight_cap: self.in_flight_cap.unwrap_or(5).max(1),
            slot_wait: self.slot_wait.unwrap_or(race_timeout),
            check_availability: self.check_availability.unwrap_or(true),
            shuffle: self.shuffle.unwrap_or(true),
            max_proxies_per_race: self.max_proxies_per_race,
        }
    }
}

/// Settings file read by the binary.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub target_date: NaiveDate,
    pub form_type: u32,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// CSV file with the applicants to register.
    pub roster: PathBuf,
    /// Optional durable roster shared by all workers.
    pub roster_store: Option<PathBuf>,
    /// Root under which the per-date artifacts directory is created.
    #[serde(default = "default_artifacts_root")]
    pub artifacts_root: PathBuf,
    pub start_at: Option<DateTime<Utc>>,
    pub stop_at: DateTime<Utc>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Drop applicants the public registrations list already shows.
    #[serde(default = "default_true")]
    pub skip_registered: bool,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub race: RaceSettings,
    #[serde(default)]
    pub captcha: CaptchaSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    /// Race through proxies at all. When off only the direct path is used.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sources; the built-in public lists are used when empty.
    #[serde(default)]
    pub sources: Vec<ProxySource>,
    #[serde(default)]
    pub trusted: Vec<String>,
    pub validation_url: Option<String>,
    pub validation_timeout_ms: Option<u64>,
    pub validation_concurrency: Option<usize>,
    pub discovery_interval_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub eviction_threshold: Option<u32>,
    pub max_requests_per_second: Option<f64>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sources: Vec::new(),
            trusted: Vec::new(),
            validation_url: None,
            validation_timeout_ms: None,
            validation_concurrency: None,
            discovery_interval_ms: None,
            sweep_interval_ms: None,
            eviction_threshold: None,
            max_requests_per_second: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RaceSettings {
    pub cycle_ms: Option<u64>,
    pub race_timeout_ms: Option<u64>,
    pub attempt_timeout_ms: Option<u64>,
    pub in_flight_cap: Option<usize>,
    pub check_availability: Option<bool>,
    pub max_proxies_per_race: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptchaSettings {
    /// Token service; each GET returns one fresh token as plain text.
    pub token_url: Option<String>,
    #[serde(default = "default_buffer")]
    pub buffer: usize,
    #[serde(default = "default_mint_concurrency")]
    pub mint_concurrency: usize,
    #[serde(default = "default_token_max_age_ms")]
    pub max_age_ms: u64,
}

impl Default for CaptchaSettings {
    fn default() -> Self {
        Self {
            token_url: None,
            buffer: default_buffer(),
            mint_concurrency: default_mint_concurrency(),
            max_age_ms: default_token_max_age_ms(),
        }
    }
}

fn default_base_url() -> String {
    "https://programarecetatenie.eu".to_string()
}

fn default_artifacts_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_workers() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_buffer() -> usize {
    50
}

fn default_mint_concurrency() -> usize {
    8
}

fn default_token_max_age_ms() -> u64 {
    110_000
}

impl Settings {
    /// Read settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    pub fn pool_config(&self) -> ProxyPoolConfig {
        let p = &self.pool;
        let sources = if p.sources.is_empty() {
            crate::sources::default_sources()
        } else {
            p.sources.clone()
        };
        let mut builder = ProxyPoolConfig::builder().sources(sources).trusted(p.trusted.clone());
        if let Some(url) = &p.validation_url {
            builder = builder.validation_url(url.clone());
        }
        if let Some(ms) = p.validation_timeout_ms {
            builder = builder.validation_timeout(Duration::from_millis(ms));
        }
        if let Some(n) = p.validation_concurrency {
            builder = builder.validation_concurrency(n);
        }
        if let Some(ms) = p.discovery_interval_ms {
            builder = builder.discovery_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = p.sweep_interval_ms {
            builder = builder.sweep_interval(Duration::from_millis(ms));
        }
        if let Some(t) = p.eviction_threshold {
            builder = builder.eviction_threshold(t);
        }
        if let Some(rps) = p.max_requests_per_second {
            builder = builder.max_requests_per_second(rps);
        }
        builder.build()
    }

    pub fn race_config(&self) -> RaceConfig {
        let r = &self.race;
        let mut builder = RaceConfig::builder();
        if let Some(ms) = r.cycle_ms {
            builder = builder.cycle_period(Duration::from_millis(ms));
        }
        if let Some(ms) = r.race_timeout_ms {
            builder = builder.race_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = r.attempt_timeout_ms {
            builder = builder.attempt_timeout(Duration::from_millis(ms));
        }
        if let Some(cap) = r.in_flight_cap {
            builder = builder.in_flight_cap(cap);
        }
        if let Some(enabled) = r.check_availability {
            builder = builder.check_availability(enabled);
        }
        if let Some(max) = r.max_proxies_per_race {
            builder = builder.max_proxies_per_race(max);
        }
        builder.build()
    }

    /// Per-date artifacts directory, e.g. `registrations_19.02.2025`.
    pub fn artifacts_dir(&self) -> PathBuf {
        self.artifacts_root
            .join(format!("registrations_{}", self.target_date.format("%d.%m.%Y")))
    }
}
