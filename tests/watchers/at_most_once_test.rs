//! At-most-once intake creation across watcher reruns and crash-window
//! duplicates.

use std::sync::Arc;

use adjutant::adapters::AdapterRegistry;
use adjutant::audit::AuditLogger;
use adjutant::intake::{parse_front_matter, IntakeItem, IntakeType, IntakeWriter, WriteOutcome};
use adjutant::vault::VaultStore;
use adjutant::watchers::filesystem::FilesystemWatcher;
use adjutant::watchers::{run_once, WatcherContext};
use chrono::Utc;

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
async fn rerunning_an_unchanged_watcher_creates_nothing() {
    let (_dir, ctx) = context();
    ctx.vault
        .write_atomic("Inbox/receipt.txt", b"lunch receipt 14.50")
        .expect("drop");

    let first = run_once(&FilesystemWatcher, &ctx).await.expect("first");
    assert_eq!(first.created, 1);

    for _ in 0..3 {
        let again = run_once(&FilesystemWatcher, &ctx).await.expect("rerun");
        assert_eq!(again.created, 0, "unchanged upstream yields zero intakes");
    }

    let wrappers = ctx.vault.list("Inbox/inbox__*.md").expect("list");
    assert_eq!(wrappers.len(), 1);
}

#[tokio::test]
async fn crash_window_duplicate_discarded_by_identity_scan() {
    let (_dir, ctx) = context();
    let writer = IntakeWriter::new(ctx.vault.clone());
    let item = IntakeItem {
        id: "evt-1".to_owned(),
        source: "gmail".to_owned(),
        received_at: Utc::now(),
        intake_type: IntakeType::Email,
        sender: "someone".to_owned(),
        subject: "hello".to_owned(),
        excerpt: "body".to_owned(),
        raw_ref: None,
        has_attachments: false,
        urgency: "normal".to_owned(),
    };

    // First write succeeds; the "crashed" re-run proposes the same event
    // under a different file name (checkpoint was not yet persisted).
    let first = writer
        .write("Needs_Action", "gmail__a__20260215-0300.md", &item)
        .expect("first");
    assert!(matches!(first, WriteOutcome::Created(_)));

    let replay = writer
        .write("Needs_Action", "gmail__a__20260215-0301.md", &item)
        .expect("replay");
    assert_eq!(replay, WriteOutcome::Duplicate);

    let wrappers = ctx.vault.list("Needs_Action/gmail__*.md").expect("list");
    assert_eq!(wrappers.len(), 1, "(source, id) is globally unique");
}

#[tokio::test]
async fn wrapper_front_matter_is_parseable_and_identifies_the_event() {
    let (_dir, ctx) = context();
    ctx.vault
        .write_atomic("Inbox/todo.md", b"- call the accountant")
        .expect("drop");

    run_once(&FilesystemWatcher, &ctx).await.expect("run");
    let wrappers = ctx.vault.list("Inbox/inbox__*.md").expect("list");
    let text = ctx.vault.read_to_string(&wrappers[0]).expect("read");
    let front = parse_front_matter(&text).expect("front matter");

    assert_eq!(front.get("source").map(String::as_str), Some("filesystem"));
    assert_eq!(front.get("type").map(String::as_str), Some("document"));
    assert!(front.contains_key("id"));
    assert!(front.contains_key("urgency"));
}
