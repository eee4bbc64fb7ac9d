//! Per-watcher checkpoints: the at-most-once record.
//!
//! A checkpoint is consulted before any intake is created and persisted
//! *after* the intake file is durably written. A crash between the two can
//! re-create an intake; the wrapper store's `(source, id)` uniqueness check
//! then discards the duplicate.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bound on the processed-id ring.
pub const PROCESSED_RING_CAP: usize = 500;

/// Watcher health as recorded in the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherHealth {
    /// Upstream reachable, intakes flowing.
    Healthy,
    /// Upstream rejected credentials; remediation intake filed.
    Degraded,
    /// Watcher disabled or never run.
    Offline,
}

/// Checkpoint persistence failures.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// I/O failure reading or writing the blob.
    #[error("checkpoint I/O at {path}: {source}")]
    Io {
        /// Blob path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The blob is not valid JSON.
    #[error("checkpoint parse at {path}: {detail}")]
    Parse {
        /// Blob path.
        path: PathBuf,
        /// Parser message.
        detail: String,
    },
}

/// Durable per-watcher state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherCheckpoint {
    /// Most recent upstream id observed.
    pub last_seen_id: Option<String>,
    /// When the watcher last ran.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Ring of processed upstream ids, bounded at
    /// [`PROCESSED_RING_CAP`].
    pub processed_ids: VecDeque<String>,
    /// Current health.
    pub health: WatcherHealth,
    /// Start of the current blocked episode, when degraded. Deduplicates
    /// remediation intakes: one per episode.
    pub blocked_since: Option<DateTime<Utc>>,
}

impl Default for WatcherCheckpoint {
    fn default() -> Self {
        Self {
            last_seen_id: None,
            last_run_at: None,
            processed_ids: VecDeque::new(),
            health: WatcherHealth::Offline,
            blocked_since: None,
        }
    }
}

impl WatcherCheckpoint {
    /// Whether this upstream id has already produced an intake.
    pub fn contains(&self, id: &str) -> bool {
        self.processed_ids.iter().any(|seen| seen == id)
    }

    /// Record a processed id, evicting the oldest beyond the ring bound.
    pub fn record(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.last_seen_id = Some(id.clone());
        self.processed_ids.push_back(id);
        while self.processed_ids.len() > PROCESSED_RING_CAP {
            self.processed_ids.pop_front();
        }
    }

    /// Enter the degraded state. Returns `true` when this call *starts* a
    /// blocked episode (the caller should file one remediation intake).
    pub fn mark_degraded(&mut self, now: DateTime<Utc>) -> bool {
        self.health = WatcherHealth::Degraded;
        if self.blocked_since.is_none() {
            self.blocked_since = Some(now);
            true
        } else {
            false
        }
    }

    /// Clear degradation after a successful run.
    pub fn mark_healthy(&mut self) {
        self.health = WatcherHealth::Healthy;
        self.blocked_since = None;
    }

    /// Load the checkpoint for `name`, or the default when none exists.
    ///
    /// # Errors
    ///
    /// Returns an error for unreadable or unparsable blobs.
    pub fn load(dir: &Path, name: &str) -> Result<Self, CheckpointError> {
        let path = Self::blob_path(dir, name);
        match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| CheckpointError::Parse {
                path,
                detail: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }

    /// Persist atomically (temp file + rename) under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn save(&self, dir: &Path, name: &str) -> Result<(), CheckpointError> {
        std::fs::create_dir_all(dir).map_err(|source| CheckpointError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = Self::blob_path(dir, name);
        let tmp = dir.join(format!(".{name}.tmp"));
        let text = serde_json::to_string_pretty(self).map_err(|e| CheckpointError::Parse {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        std::fs::write(&tmp, text).map_err(|source| CheckpointError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| CheckpointError::Io { path, source })
    }

    fn blob_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.json"))
    }
}
