//! Proxy list sources.
//!
//! Every source yields raw candidate strings which are normalized to
//! `scheme://host:port` before they reach the pool. Sources hold no state;
//! a source that cannot be fetched simply contributes nothing.

use crate::error::SourceError;

use futures::future;
use log::{info, warn};
use rand::Rng;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::LazyLock;
use url::Url;

static HOST_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9.\-]+:\d{1,5}$").expect("valid regex"));
static PORT_RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(\d+)-(\d+)>").expect("valid regex"));

const SCHEMES: &[&str] = &["http", "https", "socks4", "socks4a", "socks5", "socks5h"];

fn default_scheme() -> String {
    "http".to_string()
}

/// A place candidate proxies are read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProxySource {
    /// Plain text list served over HTTP, one proxy per line.
    List {
        url: String,
        #[serde(default = "default_scheme")]
        scheme: String,
    },
    /// GeoNode style JSON API: `{"data": [{"ip": .., "port": ..}]}`.
    GeoNode {
        url: String,
        #[serde(default = "default_scheme")]
        scheme: String,
    },
    /// Local file, one proxy per line. Lines may carry a `<lo-hi>` port template.
    File {
        path: PathBuf,
        #[serde(default = "default_scheme")]
        scheme: String,
    },
}

impl ProxySource {
    /// Short label for logs.
    pub fn label(&self) -> String {
        match self {
            ProxySource::List { url, .. } | ProxySource::GeoNode { url, .. } => url.clone(),
            ProxySource::File { path, .. } => path.display().to_string(),
        }
    }

    /// Fetch and normalize the candidates offered by this source.
    pub async fn fetch(&self, http: &Client) -> Result<Vec<String>, SourceError> {
        match self {
            ProxySource::List { url, scheme } => {
                let content = http.get(url).send().await?.error_for_status()?.text().await?;
                Ok(parse_proxy_list(&content, scheme))
            }
            ProxySource::GeoNode { url, scheme } => {
                let body = http.get(url).send().await?.error_for_status()?.text().await?;
                parse_geonode(&body, scheme)
            }
            ProxySource::File { path, scheme } => {
                let content = tokio::fs::read_to_string(path).await.map_err(|source| SourceError::File {
                    path: path.clone(),
                    source,
                })?;
                let expanded: String = content
                    .lines()
                    .map(expand_port_range)
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(parse_proxy_list(&expanded, scheme))
            }
        }
    }
}

/// Public lists polled when no sources are configured.
pub fn default_sources() -> Vec<ProxySource> {
    let list = |url: &str, scheme: &str| ProxySource::List {
        url: url.to_string(),
        scheme: scheme.to_string(),
    };
    vec![
        list("https://raw.githubusercontent.com/MuRongPIG/Proxy-Master/main/http.txt", "http"),
        list("https://raw.githubusercontent.com/MuRongPIG/Proxy-Master/main/socks5.txt", "socks5"),
        list(
            "https://raw.githubusercontent.com/Anonym0usWork1221/Free-Proxies/main/proxy_files/http_proxies.txt",
            "http",
        ),
        list("https://raw.githubusercontent.com/Zaeem20/FREE_PROXIES_LIST/master/http.txt", "http"),
        list("https://raw.githubusercontent.com/im-razvan/proxy_list/main/http.txt", "http"),
        list("https://raw.githubusercontent.com/TheSpeedX/SOCKS-List/master/http.txt", "http"),
        ProxySource::GeoNode {
            url: "https://proxylist.geonode.com/api/proxy-list?protocols=http&limit=500&sort_by=lastChecked&sort_type=desc"
                .to_string(),
            scheme: "http".to_string(),
        },
    ]
}

/// Poll every source concurrently and merge the results.
///
/// Failed sources are logged and skipped.
pub async fn fetch_all(sources: &[ProxySource], http: &Client) -> HashSet<String> {
    let results = future::join_all(sources.iter().map(|source| async move {
        (source.label(), source.fetch(http).await)
    }))
    .await;

    let mut all = HashSet::new();
    for (label, result) in results {
        match result {
            Ok(found) => {
                info!("Fetched {} proxies from {}", found.len(), label);
                all.extend(found);
            }
            Err(e) => warn!("Failed to fetch proxies from {}: {}", label, e),
        }
    }
    all
}

/// Parse text content into normalized proxy URLs.
pub fn parse_proxy_list(content: &str, default_scheme: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| normalize_proxy(line, default_scheme))
        .collect()
}

fn parse_geonode(body: &str, scheme: &str) -> Result<Vec<String>, SourceError> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    let entries = value["data"].as_array().cloned().unwrap_or_default();
    Ok(entries
        .iter()
        .filter_map(|entry| {
            let ip = entry["ip"].as_str()?;
            let port = match &entry["port"] {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => return None,
            };
            normalize_proxy(&format!("{}:{}", ip, port), scheme)
        })
        .collect())
}

/// Normalize one raw candidate to `scheme://[user:pass@]host:port`.
///
/// Bare lines must look like `host:port`; lines with a scheme must use one
/// reqwest can tunnel through. Anything else is dropped.
pub fn normalize_proxy(raw: &str, default_scheme: &str) -> Option<String> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let candidate = if line.contains("://") {
        line.to_string()
    } else if HOST_PORT.is_match(line) {
        format!("{}://{}", default_scheme, line)
    } else {
        return None;
    };

    let url = Url::parse(&candidate).ok()?;
    let scheme = url.scheme().to_ascii_lowercase();
    if !SCHEMES.contains(&scheme.as_str()) {
        return None;
    }
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;

    let credentials = match (url.username(), url.password()) {
        ("", _) => String::new(),
        (user, Some(pass)) => format!("{}:{}@", user, pass),
        (user, None) => format!("{}@", user),
    };
    Some(format!("{}://{}{}:{}", scheme, credentials, host, port))
}

/// Replace a `<lo-hi>` port template with a random port in `lo..hi`.
pub fn expand_port_range(line: &str) -> String {
    let Some(caps) = PORT_RANGE.captures(line) else {
        return line.to_string();
    };
    let lo: u32 = caps[1].parse().unwrap_or(0);
    let hi: u32 = caps[2].parse().unwrap_or(0);
    let port = if lo < hi { rand::rng().random_range(lo..hi) } else { lo };
    PORT_RANGE.replace(line, port.to_string()).into_owned()
}
