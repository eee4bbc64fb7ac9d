//! Perception watchers and their shared run harness.
//!
//! Watchers are perception-only: they turn upstream events into intake
//! wrappers and never perform external mutation. The harness owns the
//! shared contract: checkpoint load/save ordering for at-most-once
//! delivery, readiness sentinels, the degradation protocol, and the audit
//! entry every run produces.

pub mod checkpoint;
pub mod filesystem;
pub mod gmail;
pub mod instagram;
pub mod linkedin;
pub mod odoo;
pub mod whatsapp;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::adapters::{AdapterError, AdapterRegistry};
use crate::audit::{Actor, AuditEntry, AuditLogger, AuditResult};
use crate::intake::{self, IntakeError, IntakeItem, IntakeWriter, WriteOutcome};
use crate::vault::{VaultError, VaultStore};

use checkpoint::{CheckpointError, WatcherCheckpoint};

/// Watcher failures.
#[derive(Debug, Error)]
pub enum WatcherError {
    /// Upstream rejected credentials or permissions; triggers the
    /// degradation protocol.
    #[error("watcher blocked by upstream auth: {0}")]
    Auth(String),
    /// Upstream unavailable or returned garbage; logged and retried on the
    /// next cadence.
    #[error("upstream failure: {0}")]
    Upstream(String),
    /// Vault I/O failed.
    #[error(transparent)]
    Vault(#[from] VaultError),
    /// Intake wrapper failure.
    #[error(transparent)]
    Intake(#[from] IntakeError),
    /// Checkpoint persistence failure.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl From<AdapterError> for WatcherError {
    fn from(err: AdapterError) -> Self {
        if err.is_auth() {
            Self::Auth(err.to_string())
        } else {
            Self::Upstream(err.to_string())
        }
    }
}

/// One intake a watcher wants created: the item plus its destination.
#[derive(Debug, Clone)]
pub struct IntakeCandidate {
    /// The perceived event.
    pub item: IntakeItem,
    /// Destination vault folder.
    pub dest_folder: &'static str,
    /// Wrapper file name.
    pub file_name: String,
}

/// Shared dependencies for watcher runs.
pub struct WatcherContext {
    /// Vault handle.
    pub vault: VaultStore,
    /// Audit logger.
    pub audit: Arc<AuditLogger>,
    /// Adapter registry (read paths only).
    pub adapters: AdapterRegistry,
    /// Directory holding checkpoint blobs.
    pub checkpoints_dir: PathBuf,
    /// Directory for readiness sentinels.
    pub ready_dir: PathBuf,
}

impl std::fmt::Debug for WatcherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherContext")
            .field("checkpoints_dir", &self.checkpoints_dir)
            .field("ready_dir", &self.ready_dir)
            .finish_non_exhaustive()
    }
}

/// A perception source.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Stable watcher name (checkpoint key, sentinel name, audit actor).
    fn name(&self) -> &'static str;

    /// Observe upstream and propose intakes, in upstream chronological
    /// order. Must not mutate anything external.
    async fn poll(
        &self,
        ctx: &WatcherContext,
        checkpoint: &WatcherCheckpoint,
    ) -> Result<Vec<IntakeCandidate>, WatcherError>;
}

/// Outcome of one watcher run.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Wrappers created this run.
    pub created: usize,
    /// Candidates discarded as duplicates.
    pub duplicates: usize,
    /// Whether the watcher is in the degraded state.
    pub degraded: bool,
}

/// Run one watcher iteration under the shared contract.
///
/// Checkpoint consultation happens before each intake write and the
/// checkpoint is persisted after each durable write, so a crash can at
/// worst re-propose an intake that the `(source, id)` uniqueness check
/// then discards.
///
/// # Errors
///
/// Returns an error only for local (vault/checkpoint) failures; upstream
/// failures are absorbed into the degradation protocol.
pub async fn run_once(
    watcher: &dyn Watcher,
    ctx: &WatcherContext,
) -> Result<RunOutcome, WatcherError> {
    let name = watcher.name();
    let mut cp = WatcherCheckpoint::load(&ctx.checkpoints_dir, name)?;
    let now = Utc::now();

    match watcher.poll(ctx, &cp).await {
        Ok(candidates) => {
            let writer = IntakeWriter::new(ctx.vault.clone());
            let mut outcome = RunOutcome::default();

            for candidate in candidates {
                if cp.contains(&candidate.item.id) {
                    outcome.duplicates = outcome.duplicates.saturating_add(1);
                    continue;
                }
                let written =
                    writer.write(candidate.dest_folder, &candidate.file_name, &candidate.item)?;
                match written {
                    WriteOutcome::Created(path) => {
                        info!(watcher = name, path = %path, "intake created");
                        outcome.created = outcome.created.saturating_add(1);
                    }
                    WriteOutcome::Duplicate => {
                        outcome.duplicates = outcome.duplicates.saturating_add(1);
                    }
                }
                // Only after the wrapper is durable does the id count as
                // processed.
                cp.record(candidate.item.id.clone());
                cp.save(&ctx.checkpoints_dir, name)?;
            }

            let was_blocked = cp.blocked_since.is_some();
            cp.mark_healthy();
            cp.last_run_at = Some(now);
            cp.save(&ctx.checkpoints_dir, name)?;
            if was_blocked {
                info!(watcher = name, "blocked episode cleared");
            }

            ctx.audit
                .log(
                    AuditEntry::new("watcher_run", Actor::Watcher(name.to_owned()), AuditResult::Ok)
                        .parameters(serde_json::json!({
                            "created": outcome.created,
                            "duplicates": outcome.duplicates,
                        })),
                )
                .map_err(|e| WatcherError::Upstream(e.to_string()))?;

            touch_ready(&ctx.ready_dir, name);
            Ok(outcome)
        }
        Err(WatcherError::Auth(detail)) => {
            warn!(watcher = name, detail = %detail, "watcher degraded by upstream auth");
            let first_of_episode = cp.mark_degraded(now);
            cp.last_run_at = Some(now);
            cp.save(&ctx.checkpoints_dir, name)?;

            if first_of_episode {
                // One remediation intake per blocked episode.
                intake::write_remediation(
                    &ctx.vault,
                    name,
                    &format!("{name} watcher blocked: re-authentication required"),
                    &format!(
                        "The {name} watcher cannot reach its upstream: {detail}. \
                         Refresh the credentials in the secrets directory; intake \
                         resumes on the next run after re-auth."
                    ),
                    now,
                )?;
            }

            ctx.audit
                .log(
                    AuditEntry::new(
                        "watcher_run",
                        Actor::Watcher(name.to_owned()),
                        AuditResult::Degraded,
                    )
                    .error_detail(detail),
                )
                .map_err(|e| WatcherError::Upstream(e.to_string()))?;

            // The sentinel stays: the orchestrator continues normally.
            touch_ready(&ctx.ready_dir, name);
            Ok(RunOutcome {
                degraded: true,
                ..RunOutcome::default()
            })
        }
        Err(other) => {
            error!(watcher = name, error = %other, "watcher run failed");
            cp.last_run_at = Some(now);
            cp.save(&ctx.checkpoints_dir, name)?;
            let _ = ctx.audit.log(
                AuditEntry::new(
                    "watcher_run",
                    Actor::Watcher(name.to_owned()),
                    AuditResult::Error,
                )
                .error_detail(other.to_string()),
            );
            Err(other)
        }
    }
}

/// Run a watcher on an interval until the shutdown signal flips.
pub async fn run_loop(
    watcher: &dyn Watcher,
    ctx: &WatcherContext,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_once(watcher, ctx).await {
                    // Upstream trouble is retried on the next tick; it
                    // never crashes the loop.
                    warn!(watcher = watcher.name(), error = %e, "watcher iteration failed");
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!(watcher = watcher.name(), "watcher loop shutting down");
                    break;
                }
            }
        }
    }
}

/// Touch the readiness sentinel `<ready_dir>/<name>.ready`.
pub fn touch_ready(ready_dir: &std::path::Path, name: &str) {
    let path = ready_dir.join(format!("{name}.ready"));
    if let Err(e) = std::fs::write(&path, b"ready") {
        warn!(path = %path.display(), error = %e, "failed to write readiness sentinel");
    }
}

/// Timestamp fragment used in wrapper file names.
pub fn file_stamp(at: chrono::DateTime<Utc>) -> String {
    at.format("%Y%m%d-%H%M").to_string()
}
