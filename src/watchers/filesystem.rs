//! Filesystem watcher: wraps raw drops in `Inbox/`.
//!
//! Identity is absolute path + mtime, so an edited file is perceived
//! again. In loop mode the watcher also subscribes to `notify` events on
//! the inbox so drops surface without waiting for the next interval scan.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::Watcher as _;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::intake::{IntakeItem, IntakeType};
use crate::plan::slugify;
use crate::vault::folders;

use super::checkpoint::WatcherCheckpoint;
use super::{file_stamp, IntakeCandidate, Watcher, WatcherContext, WatcherError};

/// Prefix that marks a file as an intake wrapper rather than a raw drop.
const WRAPPER_PREFIX: &str = "inbox__";

/// Bytes of a dropped text file quoted into the excerpt.
const EXCERPT_READ_CAP: usize = 4096;

/// Watches `Inbox/` for new raw drops.
#[derive(Debug, Default)]
pub struct FilesystemWatcher;

#[async_trait]
impl Watcher for FilesystemWatcher {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn poll(
        &self,
        ctx: &WatcherContext,
        _checkpoint: &WatcherCheckpoint,
    ) -> Result<Vec<IntakeCandidate>, WatcherError> {
        let mut found: Vec<(DateTime<Utc>, IntakeCandidate)> = Vec::new();

        for rel in ctx.vault.list(&format!("{}/*", folders::INBOX))? {
            let Some(name) = rel.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(WRAPPER_PREFIX) || name.starts_with('.') {
                continue;
            }
            let abs = ctx.vault.resolve(&rel)?;
            let Ok(metadata) = std::fs::metadata(&abs) else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let mtime: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());

            let excerpt = read_text_excerpt(&abs);
            let item = IntakeItem {
                id: format!("{}:{}", abs.display(), mtime.timestamp()),
                source: "filesystem".to_owned(),
                received_at: Utc::now(),
                intake_type: IntakeType::Document,
                sender: "filesystem".to_owned(),
                subject: name.to_owned(),
                excerpt,
                raw_ref: Some(rel.display().to_string()),
                has_attachments: false,
                urgency: "normal".to_owned(),
            };
            let candidate = IntakeCandidate {
                file_name: format!(
                    "{WRAPPER_PREFIX}{}__{}.md",
                    slugify(name),
                    file_stamp(item.received_at)
                ),
                dest_folder: folders::INBOX,
                item,
            };
            found.push((mtime, candidate));
        }

        // Upstream chronological order.
        found.sort_by_key(|(mtime, _)| *mtime);
        Ok(found.into_iter().map(|(_, c)| c).collect())
    }
}

/// Quote the head of a text file; binary or unreadable files get a stub.
fn read_text_excerpt(path: &std::path::Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => {
            let head = &bytes[..bytes.len().min(EXCERPT_READ_CAP)];
            match std::str::from_utf8(head) {
                Ok(text) => text.to_owned(),
                Err(_) => format!("(binary file, {} bytes)", bytes.len()),
            }
        }
        Err(_) => "(unreadable)".to_owned(),
    }
}

/// Loop mode with filesystem events: scan on every interval tick and also
/// shortly after any `notify` event on the inbox directory.
pub async fn run_loop_with_events(
    ctx: &WatcherContext,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let watcher_impl = FilesystemWatcher;
    let inbox_abs = match ctx.vault.resolve(folders::INBOX) {
        Ok(path) => path,
        Err(e) => {
            warn!(error = %e, "cannot resolve inbox; falling back to interval-only loop");
            super::run_loop(&watcher_impl, ctx, interval, shutdown_rx).await;
            return;
        }
    };

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    let mut fs_watcher = match notify::recommended_watcher(move |result| {
        if let Ok(event) = result {
            let event: notify::Event = event;
            if event.kind.is_create() || event.kind.is_modify() {
                let _ = event_tx.send(());
            }
        }
    }) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, "notify unavailable; interval scans only");
            None
        }
    };
    if let Some(ref mut w) = fs_watcher {
        if let Err(e) = w.watch(&inbox_abs, notify::RecursiveMode::NonRecursive) {
            warn!(error = %e, "failed to watch inbox; interval scans only");
        }
    }

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = super::run_once(&watcher_impl, ctx).await {
                    warn!(error = %e, "filesystem watcher iteration failed");
                }
            }
            Some(()) = event_rx.recv() => {
                // Debounce: a burst of events becomes one scan.
                tokio::time::sleep(Duration::from_millis(250)).await;
                while event_rx.try_recv().is_ok() {}
                if let Err(e) = super::run_once(&watcher_impl, ctx).await {
                    warn!(error = %e, "filesystem watcher event scan failed");
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("filesystem watcher loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterRegistry;
    use crate::audit::AuditLogger;
    use crate::vault::VaultStore;
    use std::sync::Arc;

    fn context() -> (tempfile::TempDir, WatcherContext) {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::init(dir.path().join("vault")).expect("vault");
        let audit = Arc::new(AuditLogger::new(vault.clone()));
        let ctx = WatcherContext {
            vault,
            audit,
            adapters: AdapterRegistry::new(),
            checkpoints_dir: dir.path().join("checkpoints"),
            ready_dir: dir.path().join("ready"),
        };
        std::fs::create_dir_all(&ctx.ready_dir).expect("ready dir");
        (dir, ctx)
    }

    #[tokio::test]
    async fn test_wraps_raw_drop_once() {
        let (_dir, ctx) = context();
        ctx.vault
            .write_atomic("Inbox/meeting-notes.txt", b"discuss Q1 invoice")
            .expect("drop file");

        let outcome = super::super::run_once(&FilesystemWatcher, &ctx)
            .await
            .expect("run");
        assert_eq!(outcome.created, 1);

        let wrappers = ctx.vault.list("Inbox/inbox__*.md").expect("list");
        assert_eq!(wrappers.len(), 1);
        let text = ctx.vault.read_to_string(&wrappers[0]).expect("read");
        assert!(text.contains("discuss Q1 invoice"));
        assert!(text.contains("source: filesystem"));

        // Second run: same file, same mtime, no new wrapper.
        let second = super::super::run_once(&FilesystemWatcher, &ctx)
            .await
            .expect("second run");
        assert_eq!(second.created, 0);
    }

    #[tokio::test]
    async fn test_ignores_existing_wrappers() {
        let (_dir, ctx) = context();
        ctx.vault
            .write_atomic("Inbox/inbox__old__20260101-0000.md", b"wrapper")
            .expect("existing wrapper");

        let outcome = super::super::run_once(&FilesystemWatcher, &ctx)
            .await
            .expect("run");
        assert_eq!(outcome.created, 0);
    }

    #[test]
    fn test_binary_excerpt_stub() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, [0u8, 159, 146, 150]).expect("write");
        let excerpt = read_text_excerpt(&path);
        assert!(excerpt.contains("binary file"));
    }
}
