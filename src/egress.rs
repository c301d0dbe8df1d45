//! Egress paths and the HTTP clients bound to them.

use crate::proxy::Proxy;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Route an HTTP attempt takes to the endpoint.
#[derive(Debug, Clone)]
pub enum Egress {
    /// No proxy.
    Direct,
    /// Through a pooled proxy.
    Via(Proxy),
}

impl Egress {
    /// Proxy identity, `None` for the direct path.
    pub fn proxy_url(&self) -> Option<&str> {
        match self {
            Egress::Direct => None,
            Egress::Via(proxy) => Some(&proxy.url),
        }
    }

    /// Wait for the proxy's rate limiter. The direct path is never throttled.
    pub async fn until_ready(&self) {
        if let Egress::Via(proxy) = self {
            proxy.limiter.until_ready().await;
        }
    }
}

impl fmt::Display for Egress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Egress::Direct => write!(f, "direct"),
            Egress::Via(proxy) => write!(f, "{}", proxy.url),
        }
    }
}

/// Keeps one `reqwest::Client` (and so one connection pool) per egress path.
pub struct ClientCache {
    timeout: Duration,
    direct: reqwest::Client,
    proxied: Mutex<HashMap<String, reqwest::Client>>,
}

impl ClientCache {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let direct = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            timeout,
            direct,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    /// Get or build the client for `egress`.
    pub fn client_for(&self, egress: &Egress) -> Result<reqwest::Client, reqwest::Error> {
        let proxy = match egress {
            Egress::Direct => return Ok(self.direct.clone()),
            Egress::Via(proxy) => proxy,
        };

        if let Some(client) = self.proxied.lock().get(&proxy.url) {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .proxy(proxy.to_reqwest_proxy()?)
            .timeout(self.timeout)
            .build()?;
        self.proxied.lock().insert(proxy.url.clone(), client.clone());
        Ok(client)
    }

    /// Drop the cached client of an evicted proxy.
    pub fn forget(&self, proxy_url: &str) {
        self.proxied.lock().remove(proxy_url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_clients_per_proxy() {
        let cache = ClientCache::new(Duration::from_secs(1)).unwrap();
        let egress = Egress::Via(Proxy::new("http://127.0.0.1:3128".into(), 5.0));

        assert!(cache.client_for(&Egress::Direct).is_ok());
        assert!(cache.client_for(&egress).is_ok());
        assert_eq!(cache.proxied.lock().len(), 1);
        assert!(cache.client_for(&egress).is_ok());
        assert_eq!(cache.proxied.lock().len(), 1);

        cache.forget("http://127.0.0.1:3128");
        assert!(cache.proxied.lock().is_empty());
        assert_eq!(egress.to_string(), "http://127.0.0.1:3128");
        assert_eq!(Egress::Direct.proxy_url(), None);
    }
}
