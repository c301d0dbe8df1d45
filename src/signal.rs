//! Cross-process coordination between racing workers.
//!
//! Two things are shared: the set of applicants some worker already brought
//! to a terminal outcome, and a per-applicant count of attempts in flight.
//! Both are best effort. A missed signal only costs a duplicate submission,
//! which the booking site answers with "already registered".

use crate::applicant::IdentityKey;
use crate::error::SignalError;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;

/// Publish/subscribe channel for terminal applicants plus a fleet-wide
/// in-flight counter.
#[async_trait]
pub trait TerminalSignalChannel: Send + Sync {
    /// Announce that `key` reached a terminal outcome.
    async fn publish(&self, key: &IdentityKey) -> Result<(), SignalError>;

    /// Keys published from now on. Backends may replay earlier ones.
    fn subscribe(&self) -> BoxStream<'static, IdentityKey>;

    async fn is_decided(&self, key: &IdentityKey) -> Result<bool, SignalError>;

    /// Take one of `cap` in-flight slots for `key`, `None` when all are taken.
    async fn try_acquire(&self, key: &IdentityKey, cap: usize) -> Result<Option<InFlightLease>, SignalError>;
}

/// An in-flight slot. Released on drop.
pub struct InFlightLease {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl InFlightLease {
    fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for InFlightLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[derive(Default)]
struct MemoryState {
    decided: HashSet<IdentityKey>,
    in_flight: HashMap<IdentityKey, usize>,
}

/// Channel shared by coordinators living in one process. Clones share state.
#[derive(Clone)]
pub struct MemorySignalChannel {
    state: Arc<Mutex<MemoryState>>,
    sender: broadcast::Sender<IdentityKey>,
}

impl MemorySignalChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            sender,
        }
    }

    pub fn in_flight(&self, key: &IdentityKey) -> usize {
        self.state.lock().in_flight.get(key).copied().unwrap_or(0)
    }
}

impl Default for MemorySignalChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalSignalChannel for MemorySignalChannel {
    async fn publish(&self, key: &IdentityKey) -> Result<(), SignalError> {
        if self.state.lock().decided.insert(key.clone()) {
            // no subscribers is fine
            let _ = self.sender.send(key.clone());
        }
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, IdentityKey> {
        let receiver = self.sender.subscribe();
        stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(key) => return Some((key, receiver)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Signal subscriber lagged, {} keys skipped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    async fn is_decided(&self, key: &IdentityKey) -> Result<bool, SignalError> {
        Ok(self.state.lock().decided.contains(key))
    }

    async fn try_acquire(&self, key: &IdentityKey, cap: usize) -> Result<Option<InFlightLease>, SignalError> {
        let mut state = self.state.lock();
        let count = state.in_flight.entry(key.clone()).or_insert(0);
        if *count >= cap {
            return Ok(None);
        }
        *count += 1;

        let shared = Arc::clone(&self.state);
        let key = key.clone();
        Ok(Some(InFlightLease::new(move || {
            let mut state = shared.lock();
            if let Some(count) = state.in_flight.get_mut(&key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.in_flight.remove(&key);
                }
            }
        })))
    }
}

/// Channel backed by a directory every worker on the host can see.
///
/// Layout:
/// - `decided/<hex key>` holds the key of a terminal applicant
/// - `inflight/<hex key>/<pid>-<n>` is one lease; leases whose mtime is older
///   than `lease_ttl` belong to a dead worker and are swept
pub struct FileSignalChannel {
    root: PathBuf,
    lease_ttl: Duration,
    poll_interval: Duration,
    next_lease: AtomicU64,
}

impl FileSignalChannel {
    pub fn new(root: impl Into<PathBuf>, lease_ttl: Duration, poll_interval: Duration) -> Result<Self, SignalError> {
        let root = root.into();
        for dir in [root.join("decided"), root.join("inflight")] {
            std::fs::create_dir_all(&dir).map_err(|source| SignalError::Io { path: dir.clone(), source })?;
        }
        Ok(Self {
            root,
            lease_ttl,
            poll_interval,
            next_lease: AtomicU64::new(0),
        })
    }

    fn decided_path(&self, key: &IdentityKey) -> PathBuf {
        self.root.join("decided").join(hex(key.as_str()))
    }

    fn inflight_dir(&self, key: &IdentityKey) -> PathBuf {
        self.root.join("inflight").join(hex(key.as_str()))
    }

    /// Count live leases in `dir`, deleting expired ones.
    async fn live_leases(&self, dir: &Path) -> Result<usize, SignalError> {
        let io_err = |source| SignalError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
        let now = SystemTime::now();
        let mut live = 0;

        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                // released while we were looking
                Err(_) => continue,
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age > self.lease_ttl {
                debug!("Removing stale lease {}", entry.path().display());
                let _ = tokio::fs::remove_file(entry.path()).await;
            } else {
                live += 1;
            }
        }
        Ok(live)
    }
}

#[async_trait]
impl TerminalSignalChannel for FileSignalChannel {
    async fn publish(&self, key: &IdentityKey) -> Result<(), SignalError> {
        let path = self.decided_path(key);
        tokio::fs::write(&path, key.as_str())
            .await
            .map_err(|source| SignalError::Io { path, source })
    }

    fn subscribe(&self) -> BoxStream<'static, IdentityKey> {
        let dir = self.root.join("decided");
        let interval = self.poll_interval;
        let state = (HashSet::<String>::new(), Vec::<IdentityKey>::new());

        stream::unfold(state, move |(mut seen, mut ready)| {
            let dir = dir.clone();
            async move {
                loop {
                    if let Some(key) = ready.pop() {
                        return Some((key, (seen, ready)));
                    }
                    if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
                        while let Ok(Some(entry)) = entries.next_entry().await {
                            let name = entry.file_name().to_string_lossy().into_owned();
                            if seen.contains(&name) {
                                continue;
                            }
                            if let Ok(key) = tokio::fs::read_to_string(entry.path()).await {
                                seen.insert(name);
                                ready.push(IdentityKey::from(key));
                            }
                        }
                    }
                    if ready.is_empty() {
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        })
        .boxed()
    }

    async fn is_decided(&self, key: &IdentityKey) -> Result<bool, SignalError> {
        let path = self.decided_path(key);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| SignalError::Io { path, source })
    }

    async fn try_acquire(&self, key: &IdentityKey, cap: usize) -> Result<Option<InFlightLease>, SignalError> {
        let dir = self.inflight_dir(key);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| SignalError::Io { path: dir.clone(), source })?;

        if self.live_leases(&dir).await? >= cap {
            return Ok(None);
        }

        let n = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("{}-{}", std::process::id(), n));
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|source| SignalError::Io {
                path: path.clone(),
                source,
            })?;

        Ok(Some(InFlightLease::new(move || {
            let _ = std::fs::remove_file(&path);
        })))
    }
}

fn hex(text: &str) -> String {
    text.bytes().map(|b| format!("{:02x}", b)).collect()
}
