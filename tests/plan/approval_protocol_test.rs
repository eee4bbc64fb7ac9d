//! The folder-based approval protocol end to end: moving files between
//! vault folders is the only signal that changes approval state.

use std::sync::Arc;

use adjutant::audit::{Actor, AuditLogger};
use adjutant::plan::lifecycle;
use adjutant::plan::markdown::PlanNarrative;
use adjutant::plan::registry::{PlanRegistry, ReconcileEvent};
use adjutant::plan::{ActionType, Channel, Plan, PlanStatus, RiskLevel};
use adjutant::vault::VaultStore;

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

fn email_plan(slug: &str) -> Plan {
    Plan::new_draft(
        "owner",
        Channel::Gmail,
        ActionType::SendEmail,
        serde_json::json!({"to": "client@example.com", "subject": "Re: Q1", "body": "done"}),
        RiskLevel::Medium,
        slug,
    )
}

async fn submitted_plan(w: &World, slug: &str) -> Plan {
    let plan = lifecycle::create_draft(
        &w.vault,
        &w.registry,
        &w.audit,
        email_plan(slug),
        &PlanNarrative {
            objective: "Reply to the client about the Q1 invoice".to_owned(),
            success_criteria: "Client receives the reply".to_owned(),
            files_to_touch: vec![],
            rollback_strategy: "Send a follow-up correction".to_owned(),
        },
        Actor::Ai,
    )
    .await
    .expect("create draft");
    lifecycle::submit_for_approval(&w.vault, &w.registry, &w.audit, &plan.id, Actor::Ai)
        .await
        .expect("submit")
}

#[tokio::test]
async fn approval_happens_only_through_the_filesystem() {
    let w = world().await;
    let plan = submitted_plan(&w, "only-files").await;
    assert_eq!(plan.status, PlanStatus::PendingApproval);

    // Nothing moved yet: reconcile observes nothing, status is unchanged.
    let events = w.registry.reconcile(&w.vault).await.expect("reconcile");
    assert!(events.is_empty());
    assert_eq!(
        w.registry.get(&plan.id).await.expect("get").status,
        PlanStatus::PendingApproval
    );

    // The human moves the file. That move is the approval.
    w.vault
        .rename(
            format!("Pending_Approval/{}", plan.file_name()),
            format!("Approved/{}", plan.file_name()),
        )
        .expect("human move");

    let events = w.registry.reconcile(&w.vault).await.expect("reconcile");
    assert!(matches!(events[0], ReconcileEvent::Approved { .. }));

    let approved = w.registry.get(&plan.id).await.expect("get");
    assert_eq!(approved.status, PlanStatus::Approved);
    let approval_ref = approved.approval_ref.expect("approval ref recorded");
    assert!(approval_ref.starts_with("move:Approved/"));
}

#[tokio::test]
async fn rejection_leaves_the_file_in_rejected() {
    let w = world().await;
    let plan = submitted_plan(&w, "say-no").await;

    w.vault
        .rename(
            format!("Pending_Approval/{}", plan.file_name()),
            format!("Rejected/{}", plan.file_name()),
        )
        .expect("human move");

    let events = w.registry.reconcile(&w.vault).await.expect("reconcile");
    assert!(matches!(events[0], ReconcileEvent::Rejected { .. }));

    let rejected = w.registry.get(&plan.id).await.expect("get");
    assert_eq!(rejected.status, PlanStatus::Rejected);
    assert!(w.vault.exists(format!("Rejected/{}", plan.file_name())));
    // The store refuses to delete the rejection record.
    assert!(w
        .vault
        .delete(format!("Rejected/{}", plan.file_name()))
        .is_err());
}

#[tokio::test]
async fn copy_instead_of_move_resolves_rejected() {
    let w = world().await;
    let plan = submitted_plan(&w, "copied").await;

    let doc = w
        .vault
        .read_to_string(format!("Pending_Approval/{}", plan.file_name()))
        .expect("read");
    w.vault
        .write_atomic(format!("Approved/{}", plan.file_name()), doc.as_bytes())
        .expect("copy to approved");
    w.vault
        .write_atomic(format!("Rejected/{}", plan.file_name()), doc.as_bytes())
        .expect("copy to rejected");

    let events = w.registry.reconcile(&w.vault).await.expect("reconcile");
    assert!(matches!(events[0], ReconcileEvent::Conflict { .. }));
    assert_eq!(
        w.registry.get(&plan.id).await.expect("get").status,
        PlanStatus::Rejected,
        "both-folders conflict resolves as rejected"
    );
}

#[tokio::test]
async fn submitted_document_is_reviewable() {
    let w = world().await;
    let plan = submitted_plan(&w, "review-me").await;

    let doc = w
        .vault
        .read_to_string(format!("Pending_Approval/{}", plan.file_name()))
        .expect("read");
    adjutant::plan::markdown::validate_sections(&doc).expect("all 12 sections present");
    assert!(doc.contains("Reply to the client about the Q1 invoice"));
    assert!(doc.contains("submitted to Pending_Approval/"));
}
