//! Draft creation and submission: the writable half of the plan lifecycle.
//!
//! Approval and rejection are *not* here; they only happen by a human
//! moving the file, observed by [`super::registry::PlanRegistry::reconcile`].

use chrono::Utc;
use thiserror::Error;

use crate::audit::{Actor, AuditEntry, AuditError, AuditLogger, AuditResult};
use crate::vault::{folders, VaultError, VaultStore};

use super::markdown::{self, PlanDocError, PlanNarrative};
use super::registry::{PlanRegistry, RegistryError, TransitionUpdate};
use super::{Plan, PlanStatus};

/// Failures while creating or submitting plans.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Vault I/O failed.
    #[error(transparent)]
    Vault(#[from] VaultError),
    /// Registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The plan document could not be edited.
    #[error(transparent)]
    Doc(#[from] PlanDocError),
    /// The audit entry could not be recorded; the operation does not count.
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// Write a draft plan into `Plans/` and register it.
///
/// # Errors
///
/// Returns an error if the document write, registry insert, or audit entry
/// fails.
pub async fn create_draft(
    vault: &VaultStore,
    registry: &PlanRegistry,
    audit: &AuditLogger,
    mut plan: Plan,
    narrative: &PlanNarrative,
    actor: Actor,
) -> Result<Plan, LifecycleError> {
    let rel = format!("{}/{}", folders::PLANS, plan.file_name());
    let document = markdown::render(&plan, narrative);
    vault.write_atomic(&rel, document.as_bytes())?;
    plan.file_path = Some(rel);
    registry.insert(&plan).await?;

    audit.log(
        AuditEntry::new("plan_created", actor, AuditResult::Ok)
            .target(format!("{}:{}", plan.channel, plan.id))
            .parameters(serde_json::json!({
                "action_type": plan.action_type.as_str(),
                "risk_level": plan.risk_level.as_str(),
            })),
    )?;
    Ok(plan)
}

/// Move a draft into `Pending_Approval/`, freezing the payload.
///
/// # Errors
///
/// Returns an error if the file move, transition, or audit entry fails.
pub async fn submit_for_approval(
    vault: &VaultStore,
    registry: &PlanRegistry,
    audit: &AuditLogger,
    id: &str,
    actor: Actor,
) -> Result<Plan, LifecycleError> {
    let plan = registry.get(id).await?;
    let name = plan.file_name();
    let src = format!("{}/{name}", folders::PLANS);
    let dst = format!("{}/{name}", folders::PENDING_APPROVAL);
    vault.rename(&src, &dst)?;

    // Record the submission in the document's approval trail.
    if let Ok(document) = vault.read_to_string(&dst) {
        if let Ok(updated) = markdown::append_entry(
            &document,
            "Approval Trail",
            Utc::now(),
            &format!("submitted to {}/ by {actor}", folders::PENDING_APPROVAL),
        ) {
            vault.write_atomic(&dst, updated.as_bytes())?;
        }
    }

    let plan = registry
        .transition(
            id,
            PlanStatus::PendingApproval,
            TransitionUpdate {
                file_path: Some(dst),
                ..TransitionUpdate::default()
            },
        )
        .await?;

    audit.log(
        AuditEntry::new("plan_submitted", actor, AuditResult::Ok)
            .target(format!("{}:{}", plan.channel, plan.id))
            .approval("pending_approval", None, None),
    )?;
    Ok(plan)
}
