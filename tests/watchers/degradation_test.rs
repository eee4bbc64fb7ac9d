//! The degradation protocol: a watcher blocked by upstream auth files one
//! remediation intake per episode and keeps the orchestrator alive.

use std::sync::Arc;

use adjutant::adapters::mock::MockAdapter;
use adjutant::adapters::AdapterRegistry;
use adjutant::audit::AuditLogger;
use adjutant::plan::Channel;
use adjutant::vault::VaultStore;
use adjutant::watchers::checkpoint::{WatcherCheckpoint, WatcherHealth};
use adjutant::watchers::gmail::GmailWatcher;
use adjutant::watchers::{run_once, WatcherContext};

fn context(adapters: AdapterRegistry) -> (tempfile::TempDir, WatcherContext) {
    let dir = tempfile::tempdir().expect("tempdir");
    let vault = VaultStore::init(dir.path().join("vault")).expect("vault");
    let audit = Arc::new(AuditLogger::new(vault.clone()));
    let ctx = WatcherContext {
        vault,
        audit,
        adapters,
        checkpoints_dir: dir.path().join("checkpoints"),
        ready_dir: dir.path().join("ready"),
    };
    std::fs::create_dir_all(&ctx.ready_dir).expect("ready dir");
    (dir, ctx)
}

#[tokio::test]
async fn blocked_watcher_degrades_once_per_episode_and_recovers() {
    // Upstream rejects credentials.
    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(MockAdapter::unauthenticated(Channel::Gmail)));
    let (dir, ctx) = context(adapters);
    let watcher = GmailWatcher::default();

    // Three consecutive blocked runs: one remediation intake total.
    for _ in 0..3 {
        let outcome = run_once(&watcher, &ctx).await.expect("degraded run");
        assert!(outcome.degraded);
    }
    let remediations = ctx
        .vault
        .list("Needs_Action/remediation__gmail__*.md")
        .expect("list");
    assert_eq!(remediations.len(), 1, "deduplicated by blocked_since");

    let cp = WatcherCheckpoint::load(&ctx.checkpoints_dir, "gmail").expect("checkpoint");
    assert_eq!(cp.health, WatcherHealth::Degraded);
    assert!(cp.blocked_since.is_some());

    // The readiness sentinel survives so the orchestrator continues.
    assert!(ctx.ready_dir.join("gmail.ready").exists());

    // Audit records degraded runs, never errors out of the loop.
    let partition = format!("Logs/{}.json", chrono::Utc::now().format("%Y-%m-%d"));
    let log = ctx.vault.read_to_string(&partition).expect("log");
    let degraded_entries = log
        .lines()
        .filter(|l| l.contains("\"degraded\"") && l.contains("watcher:gmail"))
        .count();
    assert_eq!(degraded_entries, 3);

    // Operator re-auths: swap in a working adapter in a fresh context
    // sharing the same state.
    let mut fixed = AdapterRegistry::new();
    fixed.register(Arc::new(MockAdapter::succeeding(Channel::Gmail)));
    let ctx2 = WatcherContext {
        vault: ctx.vault.clone(),
        audit: Arc::clone(&ctx.audit),
        adapters: fixed,
        checkpoints_dir: dir.path().join("checkpoints"),
        ready_dir: dir.path().join("ready"),
    };
    let outcome = run_once(&watcher, &ctx2).await.expect("recovered run");
    assert!(!outcome.degraded);

    let cp = WatcherCheckpoint::load(&ctx2.checkpoints_dir, "gmail").expect("checkpoint");
    assert_eq!(cp.health, WatcherHealth::Healthy);
    assert!(cp.blocked_since.is_none(), "episode cleared after re-auth");
}
