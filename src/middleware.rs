//! Middleware implementation for reqwest.

use crate::config::ProxyPoolConfig;
use crate::egress::{ClientCache, Egress};
use crate::error::PoolError;
use crate::pool::ProxyPool;

use anyhow::anyhow;
use async_trait::async_trait;
use log::{info, warn};
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::sync::Arc;
use std::time::Instant;

/// Middleware that sends every request through the best proxy the pool
/// knows for the request URL, retrying with other proxies on failure.
#[derive(Clone)]
pub struct ProxyPoolMiddleware {
    pool: Arc<ProxyPool>,
    clients: Arc<ClientCache>,
}

impl ProxyPoolMiddleware {
    /// Create a pool with the given configuration and wrap it.
    /// This performs the first discovery round before returning.
    pub async fn new(config: ProxyPoolConfig) -> std::result::Result<Self, PoolError> {
        let pool = ProxyPool::new(config).await?;
        let stats = pool.get_stats();
        info!("Proxy pool initialized with {}/{} active proxies", stats.active, stats.total);
        Ok(Self::with_pool(pool)?)
    }

    /// Wrap an existing pool.
    pub fn with_pool(pool: Arc<ProxyPool>) -> std::result::Result<Self, reqwest::Error> {
        let clients = Arc::new(ClientCache::new(pool.config.validation_timeout)?);
        Ok(Self { pool, clients })
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }
}

#[async_trait]
impl Middleware for ProxyPoolMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        _extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        let max_retries = self.pool.config.retry_count;
        let target = req.url().to_string();
        let mut retry_count = 0;

        loop {
            let proxy = match self.pool.best_proxy(Some(&target)) {
                Ok(proxy) => proxy,
                Err(e) => {
                    let stats = self.pool.get_stats();
                    warn!("No proxy available. Total: {}, Active: {}", stats.total, stats.active);
                    return Err(Error::Middleware(anyhow!(e)));
                }
            };

            let proxied_request = req.try_clone().ok_or_else(|| {
                Error::Middleware(anyhow!(
                    "Request object is not cloneable. Are you passing a streaming body?"
                ))
            })?;

            let proxy_url = proxy.url.clone();
            info!("Using proxy: {} (attempt {})", proxy_url, retry_count + 1);

            let egress = Egress::Via(proxy);
            egress.until_ready().await;

            let client = match self.clients.client_for(&egress) {
                Ok(client) => client,
                Err(e) => {
                    warn!("Failed to build client with proxy {}: {}", proxy_url, e);
                    self.pool.report(&proxy_url, false, None);
                    retry_count += 1;
                    if retry_count > max_retries {
                        return Err(Error::Reqwest(e));
                    }
                    continue;
                }
            };

            let start = Instant::now();
            match client.execute(proxied_request).await {
                Ok(response) if response.status().is_success() => {
                    self.pool
                        .report_for_target(&proxy_url, &target, true, Some(start.elapsed()));
                    return Ok(response);
                }
                Ok(response) => {
                    // blocked or throttled by the target; another proxy may fare better
                    warn!("Proxy {} got HTTP {} (attempt {})", proxy_url, response.status(), retry_count + 1);
                    self.pool.report_for_target(&proxy_url, &target, false, None);
                    retry_count += 1;
                    if retry_count > max_retries {
                        return Ok(response);
                    }
                }
                Err(err) => {
                    warn!(
                        "Request failed with proxy {} (attempt {}): {}",
                        proxy_url,
                        retry_count + 1,
                        err
                    );
                    self.pool.report_for_target(&proxy_url, &target, false, None);
                    self.clients.forget(&proxy_url);
                    retry_count += 1;
                    if retry_count > max_retries {
                        return Err(Error::Reqwest(err));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest_middleware::ClientBuilder;

    #[tokio::test]
    async fn empty_pool_reports_no_proxy() {
        let pool = ProxyPool::with_config(ProxyPoolConfig::builder().build()).unwrap();
        let middleware = ProxyPoolMiddleware::with_pool(pool).unwrap();
        let client = ClientBuilder::new(reqwest::Client::new()).with(middleware).build();

        let err = client.get("http://127.0.0.1:9/").send().await.unwrap_err();
        match err {
            Error::Middleware(e) => assert!(e.to_string().contains("No proxy available")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn dead_proxies_are_penalized_on_every_retry() {
        let config = ProxyPoolConfig::builder()
            .retry_count(2)
            .validation_timeout(std::time::Duration::from_millis(500))
            .build();
        let pool = ProxyPool::with_config(config).unwrap();
        pool.admit_trusted(["http://127.0.0.1:1"]);
        let middleware = ProxyPoolMiddleware::with_pool(Arc::clone(&pool)).unwrap();
        let client = ClientBuilder::new(reqwest::Client::new()).with(middleware).build();

        assert!(client.get("http://127.0.0.1:9/").send().await.is_err());
        let proxy = pool.active_proxies().pop().unwrap();
        assert_eq!(proxy.failure_count, 3);
    }
}
