//! Adaptive proxy pool.
//!
//! The pool discovers candidates from its sources, probes them against a
//! neutral IP-echo endpoint, and keeps the survivors `Active`. Callers report
//! the result of every request made through a proxy; failures accumulate and
//! evict the proxy for the rest of the run, successes pay failures back.
//!
//! Besides the global ranking the pool keeps, per target URL, a list of
//! proxies known to reach that URL with HTTP 200, fastest first. The list is
//! refreshed by a background sweep and by request feedback.
//!
//! All mutable state sits behind one coarse lock. Every operation under it
//! is a small read-modify-write, no I/O happens while it is held.

use crate::config::ProxyPoolConfig;
use crate::egress::{ClientCache, Egress};
use crate::error::{NoProxyAvailable, PoolError};
use crate::proxy::{Proxy, ProxyState};
use crate::sources;

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Snapshot of pool membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone)]
struct TargetEntry {
    url: String,
    latency: Duration,
}

#[derive(Default)]
struct PoolState {
    proxies: HashMap<String, Proxy>,
    targets: HashMap<String, Vec<TargetEntry>>,
}

/// A pool of proxies scored by request feedback.
pub struct ProxyPool {
    state: RwLock<PoolState>,
    /// Configuration for the pool.
    pub config: ProxyPoolConfig,
    sweep_clients: ClientCache,
}

impl ProxyPool {
    /// Create a pool, run the first discovery round and start background discovery.
    ///
    /// Fails with [`PoolError::Exhausted`] when no candidate survives
    /// validation, so the caller can back off instead of racing without proxies.
    pub async fn new(config: ProxyPoolConfig) -> Result<Arc<Self>, PoolError> {
        let pool = Self::with_config(config)?;

        let candidates = pool.refresh_sources().await;
        let stats = pool.get_stats();
        info!("Initial proxy pool status: {}/{} active proxies", stats.active, stats.total);

        if stats.active == 0 {
            return Err(PoolError::Exhausted { candidates });
        }

        if let Err(e) = pool.spawn_discovery() {
            warn!("Failed to start proxy discovery worker: {}", e);
        }
        Ok(pool)
    }

    /// Create an empty pool without touching the network.
    pub fn with_config(config: ProxyPoolConfig) -> Result<Arc<Self>, reqwest::Error> {
        let sweep_clients = ClientCache::new(config.sweep_timeout)?;
        Ok(Arc::new(Self {
            state: RwLock::new(PoolState::default()),
            config,
            sweep_clients,
        }))
    }

    /// Poll every source, admit unknown candidates and validate them.
    ///
    /// Returns the number of candidates the sources offered.
    pub async fn refresh_sources(&self) -> usize {
        info!("Polling {} proxy sources", self.config.sources.len());

        self.admit_trusted(self.config.trusted.clone());

        let http = match reqwest::Client::builder().timeout(Duration::from_secs(30)).build() {
            Ok(http) => http,
            Err(e) => {
                warn!("Failed to build source client: {}", e);
                return 0;
            }
        };
        let found = sources::fetch_all(&self.config.sources, &http).await;
        let candidates = found.len();

        let admitted = self.admit(found);
        info!("Found {} candidates, {} new", candidates, admitted.len());

        let promoted = self.validate_discovered().await;
        let stats = self.get_stats();
        info!(
            "Proxy pool status update: {} promoted, {}/{} active, {} evicted",
            promoted, stats.active, stats.total, stats.evicted
        );
        candidates
    }

    /// Add raw candidates as `Discovered`. Known identities, evicted ones
    /// included, are skipped. Returns the newly admitted identities.
    pub fn admit<I, S>(&self, raw: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.write();
        let mut admitted = Vec::new();
        for candidate in raw {
            let Some(url) = sources::normalize_proxy(candidate.as_ref(), "http") else {
                continue;
            };
            if state.proxies.contains_key(&url) {
                continue;
            }
            state
                .proxies
                .insert(url.clone(), Proxy::new(url.clone(), self.config.max_requests_per_second));
            admitted.push(url);
        }
        admitted
    }

    /// Admit proxies straight to `Active`, skipping validation.
    pub fn admit_trusted<I, S>(&self, raw: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut promoted = 0;
        for candidate in raw {
            if let Some(url) = sources::normalize_proxy(candidate.as_ref(), "http") {
                if self.promote(&url, None) {
                    promoted += 1;
                }
            }
        }
        promoted
    }

    /// Probe every `Discovered` proxy. Survivors become `Active`, the rest are
    /// dropped silently and may come back with a later discovery round.
    pub async fn validate_discovered(&self) -> usize {
        let pending: Vec<String> = {
            let mut state = self.state.write();
            state
                .proxies
                .values_mut()
                .filter(|p| p.state == ProxyState::Discovered)
                .map(|p| {
                    p.state = ProxyState::Validating;
                    p.url.clone()
                })
                .collect()
        };
        if pending.is_empty() {
            return 0;
        }
        debug!("Validating {} proxies", pending.len());

        let check_url = self.config.validation_url.clone();
        let timeout = self.config.validation_timeout;
        let results: Vec<(String, Option<Duration>)> = stream::iter(pending)
            .map(|url| {
                let check_url = check_url.clone();
                async move {
                    let latency = probe(&url, &check_url, timeout).await;
                    (url, latency)
                }
            })
            .buffer_unordered(self.config.validation_concurrency)
            .collect()
            .await;

        let mut promoted = 0;
        for (url, latency) in results {
            match latency {
                Some(latency) => {
                    if self.promote(&url, Some(latency)) {
                        promoted += 1;
                    }
                }
                None => {
                    let mut state = self.state.write();
                    if state.proxies.get(&url).is_some_and(|p| p.state == ProxyState::Validating) {
                        state.proxies.remove(&url);
                    }
                }
            }
        }
        promoted
    }

    /// Mark a proxy `Active`, inserting it if unknown. Evicted proxies stay evicted.
    ///
    /// Returns whether the proxy is active afterwards.
    pub fn promote(&self, url: &str, latency: Option<Duration>) -> bool {
        let mut state = self.state.write();
        let proxy = state
            .proxies
            .entry(url.to_string())
            .or_insert_with(|| Proxy::new(url.to_string(), self.config.max_requests_per_second));

        if proxy.state == ProxyState::Evicted {
            return false;
        }
        if proxy.state != ProxyState::Active {
            debug!("Proxy {} status changed: {:?} -> Active", proxy.url, proxy.state);
        }
        proxy.state = ProxyState::Active;
        if latency.is_some() {
            proxy.latency = latency;
        }
        proxy.last_check = Instant::now();
        true
    }

    /// Report the result of a request made through `url`.
    pub fn report(&self, url: &str, success: bool, latency: Option<Duration>) {
        self.record(url, None, success, latency);
    }

    /// Report the result of a request to `target` made through `url`.
    ///
    /// Successful requests with a latency sample also update the warm list
    /// for `target`; failures drop the proxy from it.
    pub fn report_for_target(&self, url: &str, target: &str, success: bool, latency: Option<Duration>) {
        self.record(url, Some(target), success, latency);
    }

    fn record(&self, url: &str, target: Option<&str>, success: bool, latency: Option<Duration>) {
        let threshold = self.config.eviction_threshold;
        let mut guard = self.state.write();
        let state = &mut *guard;

        let Some(proxy) = state.proxies.get_mut(url) else {
            return;
        };
        if !proxy.is_active() {
            return;
        }
        proxy.last_check = Instant::now();

        if success {
            proxy.failure_count = proxy.failure_count.saturating_sub(1);
            proxy.success_count += 1;
            if let (Some(target), Some(latency)) = (target, latency) {
                let list = state.targets.entry(target.to_string()).or_default();
                match list.iter_mut().find(|e| e.url == url) {
                    Some(entry) => entry.latency = latency,
                    None => list.push(TargetEntry {
                        url: url.to_string(),
                        latency,
                    }),
                }
                list.sort_by_key(|e| e.latency);
            }
            return;
        }

        proxy.failure_count += 1;
        if proxy.failure_count >= threshold {
            proxy.state = ProxyState::Evicted;
            warn!(
                "Proxy {} evicted: {} net failures, {} successes",
                proxy.url, proxy.failure_count, proxy.success_count
            );
            for list in state.targets.values_mut() {
                list.retain(|e| e.url != url);
            }
            drop(guard);
            self.sweep_clients.forget(url);
        } else if let Some(list) = target.and_then(|t| state.targets.get_mut(t)) {
            list.retain(|e| e.url != url);
        }
    }

    /// Pick the proxy most likely to reach `target` quickly.
    ///
    /// Prefers the lowest latency measured against `target`; without samples,
    /// the lowest failure count. Ties are broken at random.
    pub fn best_proxy(&self, target: Option<&str>) -> Result<Proxy, NoProxyAvailable> {
        let state = self.state.read();
        let mut rng = rand::rng();

        if let Some(list) = target.and_then(|t| state.targets.get(t)) {
            let mut warm: Vec<&TargetEntry> = list
                .iter()
                .filter(|e| state.proxies.get(&e.url).is_some_and(Proxy::is_active))
                .collect();
            warm.shuffle(&mut rng);
            if let Some(best) = warm.into_iter().min_by_key(|e| e.latency) {
                if let Some(proxy) = state.proxies.get(&best.url) {
                    return Ok(proxy.clone());
                }
            }
        }

        let mut active: Vec<&Proxy> = state.proxies.values().filter(|p| p.is_active()).collect();
        active.shuffle(&mut rng);
        active
            .into_iter()
            .min_by_key(|p| p.failure_count)
            .cloned()
            .ok_or(NoProxyAvailable)
    }

    /// All active proxies, best first for `target`.
    pub fn ranked_proxies(&self, target: Option<&str>) -> Vec<Proxy> {
        let state = self.state.read();
        let mut rng = rand::rng();

        let mut ranked: Vec<Proxy> = Vec::new();
        if let Some(list) = target.and_then(|t| state.targets.get(t)) {
            ranked.extend(
                list.iter()
                    .filter_map(|e| state.proxies.get(&e.url))
                    .filter(|p| p.is_active())
                    .cloned(),
            );
        }

        let mut rest: Vec<&Proxy> = state
            .proxies
            .values()
            .filter(|p| p.is_active() && !ranked.iter().any(|r| r.url == p.url))
            .collect();
        rest.shuffle(&mut rng);
        rest.sort_by_key(|p| p.failure_count);
        ranked.extend(rest.into_iter().cloned());
        ranked
    }

    /// Every proxy that may currently be handed out.
    pub fn active_proxies(&self) -> Vec<Proxy> {
        self.state
            .read()
            .proxies
            .values()
            .filter(|p| p.is_active())
            .cloned()
            .collect()
    }

    /// Warm list for `target`: proxy identity and latency, fastest first.
    pub fn target_proxies(&self, target: &str) -> Vec<(String, Duration)> {
        self.state
            .read()
            .targets
            .get(target)
            .map(|list| list.iter().map(|e| (e.url.clone(), e.latency)).collect())
            .unwrap_or_default()
    }

    /// Current membership of a proxy, if known.
    pub fn state_of(&self, url: &str) -> Option<ProxyState> {
        self.state.read().proxies.get(url).map(|p| p.state)
    }

    /// Get statistics about the proxy pool.
    pub fn get_stats(&self) -> PoolStats {
        let state = self.state.read();
        let mut stats = PoolStats {
            total: state.proxies.len(),
            ..PoolStats::default()
        };
        for proxy in state.proxies.values() {
            match proxy.state {
                ProxyState::Active => stats.active += 1,
                ProxyState::Evicted => stats.evicted += 1,
                _ => {}
            }
        }
        stats
    }

    /// Probe every active proxy against `target` and rebuild its warm list
    /// from the ones answering HTTP 200, fastest first.
    pub async fn sweep_target(&self, target: &str) -> usize {
        let proxies = self.active_proxies();
        if proxies.is_empty() {
            return 0;
        }

        let mut reachable: Vec<TargetEntry> = stream::iter(proxies)
            .map(|proxy| async move {
                let client = self.sweep_clients.client_for(&Egress::Via(proxy.clone())).ok()?;
                let start = Instant::now();
                let response = client.get(target).send().await.ok()?;
                (response.status() == reqwest::StatusCode::OK).then(|| TargetEntry {
                    url: proxy.url,
                    latency: start.elapsed(),
                })
            })
            .buffer_unordered(self.config.validation_concurrency)
            .filter_map(|entry| async move { entry })
            .collect()
            .await;
        reachable.sort_by_key(|e| e.latency);

        let mut state = self.state.write();
        reachable.retain(|e| state.proxies.get(&e.url).is_some_and(Proxy::is_active));
        let count = reachable.len();
        state.targets.insert(target.to_string(), reachable);
        debug!("Sweep of {} found {} reachable proxies", target, count);
        count
    }

    /// Keep the warm list for `target` fresh in the background.
    pub fn spawn_sweep(self: &Arc<Self>, target: String) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                pool.sweep_target(&target).await;
                tokio::time::sleep(pool.config.sweep_interval).await;
            }
        })
    }

    /// Re-poll the sources periodically on a dedicated thread with its own
    /// runtime, so validating thousands of candidates never competes with
    /// the tasks driving submission attempts. The worker stops once the pool
    /// is dropped.
    pub fn spawn_discovery(self: &Arc<Self>) -> std::io::Result<std::thread::JoinHandle<()>> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.discovery_interval;

        std::thread::Builder::new()
            .name("proxy-discovery".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        warn!("Proxy discovery runtime failed to start: {}", e);
                        return;
                    }
                };
                runtime.block_on(async move {
                    loop {
                        tokio::time::sleep(interval).await;
                        let Some(pool) = pool.upgrade() else {
                            break;
                        };
                        pool.refresh_sources().await;
                    }
                });
            })
    }
}

/// GET `check_url` through `proxy_url`, returning the latency on success.
async fn probe(proxy_url: &str, check_url: &str, timeout: Duration) -> Option<Duration> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .proxy(reqwest::Proxy::all(proxy_url).ok()?)
        .build()
        .ok()?;

    let start = Instant::now();
    match client.get(check_url).send().await {
        Ok(resp) if resp.status().is_success() => Some(start.elapsed()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "https://booking.example.com/programare_online";

    fn pool() -> Arc<ProxyPool> {
        ProxyPool::with_config(ProxyPoolConfig::builder().build()).unwrap()
    }

    #[test]
    fn admit_normalizes_and_dedups() {
        let pool = pool();
        let admitted = pool.admit(["1.2.3.4:8080", "http://1.2.3.4:8080", "nonsense", "socks5://5.6.7.8:1080"]);
        assert_eq!(admitted, vec!["http://1.2.3.4:8080", "socks5://5.6.7.8:1080"]);
        assert_eq!(pool.state_of("http://1.2.3.4:8080"), Some(ProxyState::Discovered));
        assert_eq!(pool.get_stats(), PoolStats { total: 2, active: 0, evicted: 0 });
        assert!(pool.best_proxy(None).is_err());
    }

    #[test]
    fn evicts_after_threshold_net_failures_and_never_readmits() {
        let pool = pool();
        pool.admit_trusted(["http://10.0.0.1:80", "http://10.0.0.2:80"]);

        for _ in 0..29 {
            pool.report("http://10.0.0.1:80", false, None);
        }
        assert_eq!(pool.state_of("http://10.0.0.1:80"), Some(ProxyState::Active));

        pool.report("http://10.0.0.1:80", false, None);
        assert_eq!(pool.state_of("http://10.0.0.1:80"), Some(ProxyState::Evicted));
        assert!(pool.active_proxies().iter().all(|p| p.url != "http://10.0.0.1:80"));

        // success, rediscovery and trusted admission all leave it evicted
        pool.report("http://10.0.0.1:80", true, None);
        assert!(pool.admit(["10.0.0.1:80"]).is_empty());
        assert_eq!(pool.admit_trusted(["http://10.0.0.1:80"]), 0);
        assert_eq!(pool.state_of("http://10.0.0.1:80"), Some(ProxyState::Evicted));

        for _ in 0..100 {
            assert_eq!(pool.best_proxy(Some(TARGET)).unwrap().url, "http://10.0.0.2:80");
        }
        assert_eq!(pool.get_stats(), PoolStats { total: 2, active: 1, evicted: 1 });
    }

    #[test]
    fn successes_pay_back_failures() {
        let pool = pool();
        pool.admit_trusted(["http://10.0.0.1:80"]);

        pool.report("http://10.0.0.1:80", true, None);
        for _ in 0..29 {
            pool.report("http://10.0.0.1:80", false, None);
        }
        pool.report("http://10.0.0.1:80", true, None);
        pool.report("http://10.0.0.1:80", false, None);
        assert_eq!(pool.state_of("http://10.0.0.1:80"), Some(ProxyState::Active));

        pool.report("http://10.0.0.1:80", false, None);
        assert_eq!(pool.state_of("http://10.0.0.1:80"), Some(ProxyState::Evicted));
    }

    #[test]
    fn prefers_lowest_latency_for_target() {
        let pool = pool();
        pool.admit_trusted(["http://10.0.0.1:80", "http://10.0.0.2:80"]);
        pool.report_for_target("http://10.0.0.1:80", TARGET, true, Some(Duration::from_millis(200)));
        pool.report_for_target("http://10.0.0.2:80", TARGET, true, Some(Duration::from_millis(50)));

        assert_eq!(pool.best_proxy(Some(TARGET)).unwrap().url, "http://10.0.0.2:80");
        assert_eq!(
            pool.target_proxies(TARGET),
            vec![
                ("http://10.0.0.2:80".to_string(), Duration::from_millis(50)),
                ("http://10.0.0.1:80".to_string(), Duration::from_millis(200)),
            ]
        );

        let ranked: Vec<String> = pool.ranked_proxies(Some(TARGET)).into_iter().map(|p| p.url).collect();
        assert_eq!(ranked, vec!["http://10.0.0.2:80", "http://10.0.0.1:80"]);
    }

    #[test]
    fn target_failure_drops_proxy_from_warm_list() {
        let pool = pool();
        pool.admit_trusted(["http://10.0.0.1:80", "http://10.0.0.2:80"]);
        pool.report_for_target("http://10.0.0.2:80", TARGET, true, Some(Duration::from_millis(50)));
        pool.report_for_target("http://10.0.0.1:80", TARGET, true, Some(Duration::from_millis(200)));

        pool.report_for_target("http://10.0.0.2:80", TARGET, false, None);
        assert_eq!(pool.best_proxy(Some(TARGET)).unwrap().url, "http://10.0.0.1:80");
    }

    #[test]
    fn falls_back_to_failure_count_without_samples() {
        let pool = pool();
        pool.admit_trusted(["http://10.0.0.1:80", "http://10.0.0.2:80", "http://10.0.0.3:80"]);
        for _ in 0..3 {
            pool.report("http://10.0.0.1:80", false, None);
            pool.report("http://10.0.0.3:80", false, None);
        }
        pool.report("http://10.0.0.2:80", false, None);

        for _ in 0..50 {
            assert_eq!(pool.best_proxy(Some(TARGET)).unwrap().url, "http://10.0.0.2:80");
        }
    }

    #[test]
    fn ties_are_spread_across_proxies() {
        let pool = pool();
        pool.admit_trusted(["http://10.0.0.1:80", "http://10.0.0.2:80"]);

        let picks: std::collections::HashSet<String> =
            (0..200).map(|_| pool.best_proxy(None).unwrap().url).collect();
        assert_eq!(picks.len(), 2);
    }

    #[tokio::test]
    async fn unreachable_candidates_are_dropped_silently() {
        let config = ProxyPoolConfig::builder()
            .validation_timeout(Duration::from_millis(500))
            .validation_url("http://127.0.0.1:9/ip")
            .build();
        let pool = ProxyPool::with_config(config).unwrap();
        pool.admit(["127.0.0.1:1", "127.0.0.1:2"]);

        assert_eq!(pool.validate_discovered().await, 0);
        assert_eq!(pool.get_stats().total, 0);
    }

    #[tokio::test]
    async fn empty_sources_exhaust_the_pool() {
        let result = ProxyPool::new(ProxyPoolConfig::builder().build()).await;
        assert!(matches!(result, Err(PoolError::Exhausted { candidates: 0 })));
    }

    #[tokio::test]
    async fn trusted_proxies_survive_an_empty_discovery() {
        let config = ProxyPoolConfig::builder().trusted(vec!["http://10.0.0.9:3128"]).build();
        let pool = ProxyPool::new(config).await.unwrap();
        assert_eq!(pool.get_stats().active, 1);
    }
}
