//! Applicant roster: loading and durable per-date storage.

use crate::applicant::{Applicant, IdentityKey, RawApplicant};
use crate::error::RosterError;

use async_trait::async_trait;
use chrono::NaiveDate;
use log::{info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Mutex, MutexGuard};

/// Durable store of applicants still pending per target date.
#[async_trait]
pub trait RosterStore: Send + Sync {
    async fn get_by_date(&self, date: NaiveDate) -> Result<Vec<Applicant>, RosterError>;

    /// Returns `false` when the applicant was already stored for `date`.
    async fn add(&self, date: NaiveDate, applicant: &Applicant) -> Result<bool, RosterError>;

    /// Returns `false` when nothing was stored under `key` for `date`.
    async fn remove(&self, date: NaiveDate, key: &IdentityKey) -> Result<bool, RosterError>;

    /// Make the stored roster for `date` equal to `applicants` under one
    /// exclusive lock. Returns `(added, removed)`.
    async fn reconcile(&self, date: NaiveDate, applicants: &[Applicant]) -> Result<(usize, usize), RosterError>;
}

type Rosters = BTreeMap<String, Vec<Applicant>>;

fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn reconcile_in(rosters: &mut Rosters, date: NaiveDate, applicants: &[Applicant]) -> (usize, usize) {
    let wanted: HashSet<IdentityKey> = applicants.iter().map(Applicant::identity).collect();
    let stored = rosters.entry(date_key(date)).or_default();

    let before = stored.len();
    stored.retain(|a| wanted.contains(&a.identity()));
    let removed = before - stored.len();

    let mut present: HashSet<IdentityKey> = stored.iter().map(Applicant::identity).collect();
    let mut added = 0;
    for applicant in applicants {
        if present.insert(applicant.identity()) {
            stored.push(applicant.clone());
            added += 1;
        }
    }
    (added, removed)
}

fn add_in(rosters: &mut Rosters, date: NaiveDate, applicant: &Applicant) -> bool {
    let stored = rosters.entry(date_key(date)).or_default();
    let key = applicant.identity();
    if stored.iter().any(|a| a.identity() == key) {
        return false;
    }
    stored.push(applicant.clone());
    true
}

fn remove_in(rosters: &mut Rosters, date: NaiveDate, key: &IdentityKey) -> bool {
    let Some(stored) = rosters.get_mut(&date_key(date)) else {
        return false;
    };
    let before = stored.len();
    stored.retain(|a| a.identity() != *key);
    stored.len() != before
}

/// In-process store.
#[derive(Default)]
pub struct MemoryRoster {
    rosters: Mutex<Rosters>,
}

impl MemoryRoster {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RosterStore for MemoryRoster {
    async fn get_by_date(&self, date: NaiveDate) -> Result<Vec<Applicant>, RosterError> {
        Ok(self.rosters.lock().await.get(&date_key(date)).cloned().unwrap_or_default())
    }

    async fn add(&self, date: NaiveDate, applicant: &Applicant) -> Result<bool, RosterError> {
        Ok(add_in(&mut *self.rosters.lock().await, date, applicant))
    }

    async fn remove(&self, date: NaiveDate, key: &IdentityKey) -> Result<bool, RosterError> {
        Ok(remove_in(&mut *self.rosters.lock().await, date, key))
    }

    async fn reconcile(&self, date: NaiveDate, applicants: &[Applicant]) -> Result<(usize, usize), RosterError> {
        Ok(reconcile_in(&mut *self.rosters.lock().await, date, applicants))
    }
}

/// JSON file shared by every worker on the host, keyed by ISO date.
///
/// Each operation is a read-modify-write under an in-process mutex and a
/// `<file>.lock` lock file. Lock files older than `stale_after` are taken
/// over, since their owner is gone.
pub struct JsonFileRoster {
    path: PathBuf,
    lock_path: PathBuf,
    local: Mutex<()>,
    lock_timeout: Duration,
    stale_after: Duration,
}

/// Holds both the in-process mutex and the lock file.
struct RosterLock<'a> {
    _local: MutexGuard<'a, ()>,
    path: PathBuf,
}

impl Drop for RosterLock<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl JsonFileRoster {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
            local: Mutex::new(()),
            lock_timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(30),
        }
    }

    async fn lock(&self) -> Result<RosterLock<'_>, RosterError> {
        let local = self.local.lock().await;
        let started = Instant::now();

        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
                .await
            {
                Ok(_) => {
                    return Ok(RosterLock {
                        _local: local,
                        path: self.lock_path.clone(),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.lock_is_stale().await {
                        warn!("Taking over stale roster lock {}", self.lock_path.display());
                        let _ = tokio::fs::remove_file(&self.lock_path).await;
                        continue;
                    }
                    if started.elapsed() > self.lock_timeout {
                        return Err(RosterError::LockTimeout(self.lock_path.clone()));
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                Err(source) => {
                    return Err(RosterError::Io {
                        path: self.lock_path.clone(),
                        source,
                    })
                }
            }
        }
    }

    async fn lock_is_stale(&self) -> bool {
        match tokio::fs::metadata(&self.lock_path).await.and_then(|m| m.modified()) {
            Ok(modified) => SystemTime::now().duration_since(modified).unwrap_or_default() > self.stale_after,
            Err(_) => false,
        }
    }

    async fn load(&self) -> Result<Rosters, RosterError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Rosters::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Rosters::new()),
            Err(source) => Err(RosterError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn save(&self, rosters: &Rosters) -> Result<(), RosterError> {
        let bytes = serde_json::to_vec_pretty(rosters)?;
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        tokio::fs::write(&tmp, bytes).await.map_err(|source| RosterError::Io {
            path: tmp.clone(),
            source,
        })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| RosterError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

#[async_trait]
impl RosterStore for JsonFileRoster {
    async fn get_by_date(&self, date: NaiveDate) -> Result<Vec<Applicant>, RosterError> {
        let _lock = self.lock().await?;
        Ok(self.load().await?.remove(&date_key(date)).unwrap_or_default())
    }

    async fn add(&self, date: NaiveDate, applicant: &Applicant) -> Result<bool, RosterError> {
        let _lock = self.lock().await?;
        let mut rosters = self.load().await?;
        let added = add_in(&mut rosters, date, applicant);
        if added {
            self.save(&rosters).await?;
        }
        Ok(added)
    }

    async fn remove(&self, date: NaiveDate, key: &IdentityKey) -> Result<bool, RosterError> {
        let _lock = self.lock().await?;
        let mut rosters = self.load().await?;
        let removed = remove_in(&mut rosters, date, key);
        if removed {
            self.save(&rosters).await?;
        }
        Ok(removed)
    }

    async fn reconcile(&self, date: NaiveDate, applicants: &[Applicant]) -> Result<(usize, usize), RosterError> {
        let _lock = self.lock().await?;
        let mut rosters = self.load().await?;
        let (added, removed) = reconcile_in(&mut rosters, date, applicants);
        if added + removed > 0 {
            self.save(&rosters).await?;
        }
        info!("Roster for {} reconciled: {} added, {} removed", date, added, removed);
        Ok((added, removed))
    }
}

/// Read and normalize a roster CSV. Rows repeating an earlier identity are
/// dropped.
pub fn load_csv(path: &Path) -> Result<Vec<Applicant>, RosterError> {
    let file = std::fs::File::open(path).map_err(|source| RosterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_csv(file)
}

fn read_csv<R: std::io::Read>(reader: R) -> Result<Vec<Applicant>, RosterError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut seen: HashMap<IdentityKey, usize> = HashMap::new();
    let mut applicants = Vec::new();

    for (i, row) in reader.deserialize::<RawApplicant>().enumerate() {
        // header is line 1
        let row_number = i + 2;
        let applicant = Applicant::normalize(row?).map_err(|source| RosterError::Applicant {
            row: row_number,
            source,
        })?;
        match seen.get(&applicant.identity()) {
            Some(first) => warn!(
                "Row {} repeats {} from row {}, skipped",
                row_number,
                applicant.display_name(),
                first
            ),
            None => {
                seen.insert(applicant.identity(), row_number);
                applicants.push(applicant);
            }
        }
    }
    Ok(applicants)
}
