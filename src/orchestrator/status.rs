//! System-status snapshot for external observers.
//!
//! One JSON file at the vault root enumerating component state: watcher
//! health from checkpoints, plan counts from the registry, and the
//! orchestrator's own heartbeat.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::registry::PlanRegistry;
use crate::plan::PlanStatus;
use crate::vault::VaultStore;
use crate::watchers::checkpoint::{WatcherCheckpoint, WatcherHealth};

/// Snapshot file name at the vault root.
pub const STATUS_FILE: &str = "system-status.json";

/// One component's observable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatus {
    /// `healthy`, `degraded`, or `offline`.
    pub state: String,
    /// Last activity timestamp, when known.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Blocked-episode start, when degraded.
    pub blocked_since: Option<DateTime<Utc>>,
}

/// The snapshot external observers read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    /// When the snapshot was written.
    pub generated_at: DateTime<Utc>,
    /// Per-watcher state.
    pub watchers: BTreeMap<String, ComponentStatus>,
    /// Plan counts by status.
    pub plan_counts: BTreeMap<String, u64>,
}

impl SystemStatus {
    /// Collect the snapshot from checkpoints and the registry.
    ///
    /// # Errors
    ///
    /// Returns an error on registry failure; missing checkpoints read as
    /// offline.
    pub async fn collect(
        registry: &PlanRegistry,
        checkpoints_dir: &Path,
        watcher_names: &[&str],
    ) -> anyhow::Result<Self> {
        let mut watchers = BTreeMap::new();
        for name in watcher_names {
            let cp = WatcherCheckpoint::load(checkpoints_dir, name).unwrap_or_default();
            let state = match cp.health {
                WatcherHealth::Healthy => "healthy",
                WatcherHealth::Degraded => "degraded",
                WatcherHealth::Offline => "offline",
            };
            watchers.insert(
                (*name).to_owned(),
                ComponentStatus {
                    state: state.to_owned(),
                    last_run_at: cp.last_run_at,
                    blocked_since: cp.blocked_since,
                },
            );
        }

        let mut plan_counts = BTreeMap::new();
        for status in [
            PlanStatus::Draft,
            PlanStatus::PendingApproval,
            PlanStatus::Approved,
            PlanStatus::Rejected,
            PlanStatus::Executed,
            PlanStatus::Failed,
            PlanStatus::Archived,
        ] {
            plan_counts.insert(
                status.as_str().to_owned(),
                registry.count_by_status(status).await?,
            );
        }

        Ok(Self {
            generated_at: Utc::now(),
            watchers,
            plan_counts,
        })
    }

    /// Write the snapshot atomically at the vault root.
    ///
    /// # Errors
    ///
    /// Returns an error on vault I/O failure.
    pub fn write(&self, vault: &VaultStore) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        vault.write_atomic(STATUS_FILE, text.as_bytes())?;
        Ok(())
    }
}
