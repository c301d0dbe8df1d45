//! Proxy representation and lifecycle state.

use governor::{clock::DefaultClock, middleware::NoOpMiddleware, state::{InMemoryState, NotKeyed}, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pool membership of a proxy.
///
/// `Evicted` is terminal: an evicted identity stays in the pool as a tombstone
/// so later discovery rounds never re-admit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Known from a source, not probed yet.
    Discovered,
    /// Probe in flight.
    Validating,
    /// Passed validation and may be handed out.
    Active,
    /// Accumulated too many failures. Never used again during this run.
    Evicted,
}

/// Per-proxy limiter type.
pub type ProxyLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Representation of a proxy server.
#[derive(Debug, Clone)]
pub struct Proxy {
    /// Identity of the proxy, normalized to `scheme://host:port`.
    pub url: String,
    /// Current pool membership.
    pub state: ProxyState,
    /// Net failure count. Failures add one, successes take one off, floored at zero.
    pub failure_count: u32,
    /// Lifetime count of successful reports, for logging.
    pub success_count: u64,
    /// Latency measured by the validation probe, if it succeeded.
    pub latency: Option<Duration>,
    /// Time when this proxy was last probed or reported.
    pub last_check: Instant,
    /// Rate limiter to control requests per second through this proxy.
    pub limiter: Arc<ProxyLimiter>,
}

impl Proxy {
    /// Create a freshly discovered proxy with the given URL and rate limit.
    pub fn new(url: String, max_rps: f64) -> Self {
        let per_second = NonZeroU32::new(max_rps.ceil() as u32).unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Self {
            url,
            state: ProxyState::Discovered,
            failure_count: 0,
            success_count: 0,
            latency: None,
            last_check: Instant::now(),
            limiter,
        }
    }

    /// Convert the proxy URL to a reqwest::Proxy.
    pub fn to_reqwest_proxy(&self) -> Result<reqwest::Proxy, reqwest::Error> {
        reqwest::Proxy::all(&self.url)
    }

    /// Whether this proxy may be handed out.
    pub fn is_active(&self) -> bool {
        self.state == ProxyState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_proxy_starts_discovered() {
        let proxy = Proxy::new("socks5://127.0.0.1:1080".into(), 0.2);
        assert_eq!(proxy.state, ProxyState::Discovered);
        assert_eq!(proxy.failure_count, 0);
        assert!(!proxy.is_active());
        assert!(proxy.to_reqwest_proxy().is_ok());
    }
}
