//! End-to-end executor scenarios: the happy email with a two-phase
//! approval, and the financial no-retry failure.

use std::sync::Arc;
use std::time::Duration;

use adjutant::adapters::mock::MockAdapter;
use adjutant::adapters::{AdapterError, AdapterRegistry, ExecutionResult};
use adjutant::audit::{Actor, AuditLogger};
use adjutant::config::ExecutorConfig;
use adjutant::executor::retry::RetryPolicy;
use adjutant::executor::{ExecOptions, ExecOutcome, Executor};
use adjutant::plan::lifecycle;
use adjutant::plan::markdown::PlanNarrative;
use adjutant::plan::registry::PlanRegistry;
use adjutant::plan::{ActionType, Channel, Plan, PlanStatus, RiskLevel};
use adjutant::vault::VaultStore;
use tokio::sync::watch;

struct World {
    _dir: tempfile::TempDir,
    vault: VaultStore,
    registry: PlanRegistry,
    audit: Arc<AuditLogger>,
}

async fn world() -> World {
    let dir = tempfile::tempdir().expect("tempdir");
    let vault = VaultStore::init(dir.path()).expect("vault");
    let registry = PlanRegistry::open_in_memory().await.expect("registry");
    let audit = Arc::new(AuditLogger::new(vault.clone()));
    World {
        _dir: dir,
        vault,
        registry,
        audit,
    }
}

fn executor(w: &World, mock: Arc<MockAdapter>) -> Executor {
    let mut adapters = AdapterRegistry::new();
    adapters.register(mock);
    Executor::new(
        w.vault.clone(),
        w.registry.clone(),
        adapters,
        Arc::clone(&w.audit),
        ExecutorConfig::default(),
    )
    .with_policy(RetryPolicy {
        base_delay: Duration::from_millis(5),
        max_attempts: 3,
    })
}

fn cancel() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}

fn today_log(w: &World) -> String {
    let partition = format!("Logs/{}.json", chrono::Utc::now().format("%Y-%m-%d"));
    w.vault.read_to_string(&partition).expect("audit partition")
}

/// Walk a plan through draft → submit → human approval.
async fn approve(w: &World, plan: Plan) -> Plan {
    let plan = lifecycle::create_draft(
        &w.vault,
        &w.registry,
        &w.audit,
        plan,
        &PlanNarrative::default(),
        Actor::Ai,
    )
    .await
    .expect("draft");
    let plan = lifecycle::submit_for_approval(&w.vault, &w.registry, &w.audit, &plan.id, Actor::Ai)
        .await
        .expect("submit");
    w.vault
        .rename(
            format!("Pending_Approval/{}", plan.file_name()),
            format!("Approved/{}", plan.file_name()),
        )
        .expect("human move");
    w.registry.reconcile(&w.vault).await.expect("reconcile");
    w.registry.get(&plan.id).await.expect("get")
}

#[tokio::test]
async fn happy_email_with_second_approval() {
    let w = world().await;
    let mock = Arc::new(MockAdapter::succeeding(Channel::Gmail));
    let executor = executor(&w, Arc::clone(&mock));

    let plan = approve(
        &w,
        Plan::new_draft(
            "owner",
            Channel::Gmail,
            ActionType::SendEmail,
            serde_json::json!({
                "to": "client@example.com",
                "subject": "Re: Q1 invoice",
                "body": "Attached as requested.",
            }),
            RiskLevel::Medium,
            "reply q1",
        ),
    )
    .await;
    assert_eq!(plan.status, PlanStatus::Approved);

    // First pass: dry-run, then pause for the second approval.
    let outcome = executor
        .execute_plan(&plan.id, ExecOptions::orchestrated(), &cancel())
        .await
        .expect("first pass");
    assert!(matches!(outcome, ExecOutcome::AwaitingSecondApproval(_)));
    assert_eq!(mock.execute_calls(), 0);

    // The preview landed in the re-queued document.
    let dryrun_doc = w
        .vault
        .read_to_string(format!("Pending_Approval/{}.dryrun.md", plan.id))
        .expect("dryrun doc");
    assert!(dryrun_doc.contains("second approval required"));

    // Human approves the preview.
    w.vault
        .rename(
            format!("Pending_Approval/{}.dryrun.md", plan.id),
            format!("Approved/{}.dryrun.md", plan.id),
        )
        .expect("second human move");
    w.registry.reconcile(&w.vault).await.expect("reconcile");

    // Second pass: execute.
    let outcome = executor
        .execute_plan(&plan.id, ExecOptions::orchestrated(), &cancel())
        .await
        .expect("second pass");
    let ExecOutcome::Executed(done) = outcome else {
        panic!("expected Executed, got {outcome:?}");
    };
    assert_eq!(done.status, PlanStatus::Executed);
    assert!(w
        .vault
        .exists(format!("Plans/completed/{}", plan.file_name())));
    assert_eq!(mock.execute_calls(), 1);

    // The audit trail has a dry_run entry and an ok entry with a
    // duration, and the recipient never appears unredacted.
    let log = today_log(&w);
    let entries: Vec<serde_json::Value> = log
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect();
    assert!(entries
        .iter()
        .any(|e| e["action_type"] == "send_email" && e["result"] == "dry_run"));
    let ok = entries
        .iter()
        .find(|e| e["action_type"] == "send_email" && e["result"] == "ok")
        .expect("ok entry");
    assert!(ok["duration_ms"].is_u64());
    assert!(!log.contains("client@example.com"), "recipient redacted");
}

#[tokio::test]
async fn financial_no_retry_fails_without_fabrication() {
    let w = world().await;
    let mock = Arc::new(MockAdapter::scripted(
        Channel::Odoo,
        vec![
            Err(AdapterError::Transient("connection reset by peer".to_owned())),
            // A second outcome that must never be consumed.
            Ok(ExecutionResult {
                object_id: "must-not-happen".to_owned(),
                endpoint_used: "x".to_owned(),
                details: serde_json::json!({}),
            }),
        ],
    ));
    let executor = executor(&w, Arc::clone(&mock));

    let mut draft = Plan::new_draft(
        "owner",
        Channel::Odoo,
        ActionType::RegisterPayment,
        serde_json::json!({"invoice_id": 42}),
        RiskLevel::High,
        "pay inv-42",
    );
    // The preview was already approved in an earlier round.
    draft.dryrun_approved = true;
    let plan = approve(&w, draft).await;

    let outcome = executor
        .execute_plan(&plan.id, ExecOptions::orchestrated(), &cancel())
        .await
        .expect("execute");
    let ExecOutcome::Failed(failed) = outcome else {
        panic!("expected Failed, got {outcome:?}");
    };

    assert_eq!(mock.execute_calls(), 1, "no-retry: exactly one attempt");
    assert_eq!(failed.status, PlanStatus::Failed);
    assert!(w.vault.exists(format!("Plans/failed/{}", plan.file_name())));

    let remediation = w
        .vault
        .list("Needs_Action/remediation__odoo__*.md")
        .expect("list");
    assert_eq!(remediation.len(), 1);
    let text = w.vault.read_to_string(&remediation[0]).expect("read");
    assert!(text.contains(&plan.id), "remediation names the plan");

    let log = today_log(&w);
    for line in log.lines() {
        let entry: serde_json::Value = serde_json::from_str(line).expect("json");
        if entry["action_type"] == "register_payment" {
            assert_ne!(entry["result"], "ok", "no fabricated success");
        }
    }
}
