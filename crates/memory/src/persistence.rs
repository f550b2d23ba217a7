//! Durable snapshots of state and memory.
//!
//! Crash-safety guarantee: a snapshot is written to a `.tmp` sibling,
//! `fsync`'d, then renamed over the durable file.  A crash before the rename
//! leaves the previous file untouched; a crash after it leaves the new one.
//! Before each replace, the current file is copied to `.bak` through the same
//! tmp-and-rename path if it still verifies, so the backup is always the most
//! recent verified snapshot and never a torn write.
//!
//! A single writer per store is enforced with an exclusive OS lock on a
//! `.lock` sibling, see [`PersistenceManager::try_lock`].

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{MemoryError, Result};
use crate::state::State;
use crate::store::MemoryImage;

/// Current snapshot format version.  Files with a newer version are rejected.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub state: State,
    #[serde(flatten)]
    pub memory: MemoryImage,
}

impl Snapshot {
    pub fn new(state: State, memory: MemoryImage) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            state,
            memory,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.version == 0 || self.version > SNAPSHOT_VERSION {
            return Err(format!("unsupported snapshot version {}", self.version));
        }
        let energy = self.state.energy;
        if !energy.is_finite() || !(0.0..=1.0).contains(&energy) {
            return Err(format!("energy {energy} outside [0, 1]"));
        }
        self.memory.validate()
    }

    fn parse(raw: &[u8]) -> std::result::Result<Self, String> {
        let snapshot: Self = serde_json::from_slice(raw).map_err(|err| err.to_string())?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// Where [`PersistenceManager::load`] found its data.
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded {
    /// No durable file and no backup: first start.
    Fresh,
    Primary(Snapshot),
    /// The durable file was corrupt; this came from the backup.
    Restored(Snapshot),
    /// Both were unusable and empty fallback is enabled.
    EmptyFallback,
}

impl Loaded {
    pub fn into_snapshot(self) -> Option<Snapshot> {
        match self {
            Self::Primary(snapshot) | Self::Restored(snapshot) => Some(snapshot),
            Self::Fresh | Self::EmptyFallback => None,
        }
    }
}

/// Retry budget for [`PersistenceManager::save_with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

/// Exclusive hold on a snapshot store.  Released when dropped.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone)]
pub struct PersistenceManager {
    path: PathBuf,
    allow_empty_fallback: bool,
}

impl PersistenceManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            allow_empty_fallback: false,
        }
    }

    pub fn with_empty_fallback(mut self, allow: bool) -> Self {
        self.allow_empty_fallback = allow;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        self.sibling("bak")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.sibling("lock")
    }

    fn tmp_path(&self) -> PathBuf {
        self.sibling("tmp")
    }

    fn corrupt_path(&self) -> PathBuf {
        self.sibling("corrupt")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let filename = self
            .path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "memory.json".to_string());
        self.path.with_file_name(format!("{filename}.{suffix}"))
    }

    /// Take the exclusive writer lock for this store without blocking.
    /// Fails with [`MemoryError::Locked`] while another holder is alive,
    /// in this process or any other.
    pub fn try_lock(&self) -> Result<StoreLock> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path = self.lock_path();
        let file = File::create(&path)?;
        FileExt::try_lock_exclusive(&file).map_err(|_| MemoryError::Locked(path.clone()))?;
        Ok(StoreLock { file, path })
    }

    /// Atomically replace the durable snapshot.  Idempotent; `.tmp` files
    /// are cleaned up on any error path.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let rendered = serde_json::to_vec_pretty(snapshot)?;

        if let Ok(current) = tokio::fs::read(&self.path).await {
            if Snapshot::parse(&current).is_ok() {
                write_atomic(&self.backup_path(), &current).await?;
            }
        }

        write_atomic(&self.path, &rendered).await
    }

    /// [`save`](Self::save) with exponential backoff.  Exhausting the budget
    /// yields [`MemoryError::Persistence`].
    pub async fn save_with_retry(&self, snapshot: &Snapshot, policy: RetryPolicy) -> Result<()> {
        let attempts = policy.max_attempts.max(1);
        let mut backoff = policy.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.save(snapshot).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= attempts => {
                    return Err(MemoryError::Persistence {
                        attempts,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    warn!(
                        attempt,
                        error = %err,
                        path = %self.path.display(),
                        backoff_ms = backoff.as_millis() as u64,
                        "snapshot save failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }

    /// Load and validate the durable snapshot, falling back to the backup
    /// when it is corrupt.  A corrupt file is moved to a `.corrupt` sibling
    /// for inspection and the backup is written back in its place.
    pub fn load(&self) -> Result<Loaded> {
        self.read_snapshot(true)
    }

    /// Same fallbacks as [`load`](Self::load), but never touches the files.
    /// For readers that do not hold the store lock.
    pub fn inspect(&self) -> Result<Loaded> {
        self.read_snapshot(false)
    }

    fn read_snapshot(&self, repair: bool) -> Result<Loaded> {
        let backup_path = self.backup_path();

        let reason = match std::fs::read(&self.path) {
            Ok(raw) => match Snapshot::parse(&raw) {
                Ok(snapshot) => return Ok(Loaded::Primary(snapshot)),
                Err(reason) => {
                    warn!(
                        path = %self.path.display(),
                        %reason,
                        repair,
                        "snapshot failed validation, trying backup"
                    );
                    if repair {
                        std::fs::rename(&self.path, self.corrupt_path())?;
                    }
                    reason
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if !backup_path.exists() {
                    return Ok(Loaded::Fresh);
                }
                warn!(path = %self.path.display(), "snapshot missing but backup present");
                "snapshot missing".to_string()
            }
            Err(err) => return Err(err.into()),
        };

        match std::fs::read(&backup_path).map_err(|err| err.to_string()).and_then(|raw| {
            Snapshot::parse(&raw).map(|snapshot| (raw, snapshot))
        }) {
            Ok((raw, snapshot)) => {
                if repair {
                    let tmp_path = self.tmp_path();
                    std::fs::write(&tmp_path, raw)?;
                    std::fs::rename(&tmp_path, &self.path)?;
                }
                info!(
                    path = %backup_path.display(),
                    saved_at = %snapshot.saved_at,
                    "recovered snapshot from backup"
                );
                Ok(Loaded::Restored(snapshot))
            }
            Err(backup_reason) if self.allow_empty_fallback => {
                warn!(
                    %reason,
                    backup = %backup_reason,
                    "no valid backup, starting from an empty snapshot"
                );
                Ok(Loaded::EmptyFallback)
            }
            Err(backup_reason) => Err(MemoryError::Corruption {
                path: self.path.clone(),
                reason: format!("{reason}; backup unusable: {backup_reason}"),
            }),
        }
    }
}

/// Write `bytes` to a `.tmp` sibling of `target`, fsync it, then rename it
/// into place.
async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = target.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let write_result: Result<()> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }

    if let Err(err) = tokio::fs::rename(&tmp_path, target).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }
    Ok(())
}
