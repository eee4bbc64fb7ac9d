//! Executor: the one component allowed to act.
//!
//! Takes a human-approved plan, verifies its preconditions against both
//! the registry and the vault, runs the adapter's dry-run, gates sensitive
//! actions behind a second approval of the preview, then executes with the
//! retry policy and records the outcome. Failures produce a remediation
//! intake; success is never synthesized: if the adapter errors, the plan
//! fails, period.

pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::adapters::{AdapterError, AdapterRegistry, ChannelAdapter, ExecutionResult, Preview};
use crate::audit::{Actor, AuditEntry, AuditError, AuditLogger, AuditResult};
use crate::config::ExecutorConfig;
use crate::intake::{self, IntakeError};
use crate::plan::registry::{PlanRegistry, RegistryError, TransitionUpdate};
use crate::plan::{
    dryrun_file_name, markdown, plan_file_name, ActionType, Channel, Plan, PlanStatus,
};
use crate::vault::{folders, VaultError, VaultStore};

use retry::RetryPolicy;

/// Infrastructure failures during execution. Plan-level outcomes (failed,
/// re-queued) are [`ExecOutcome`] values, not errors.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Registry access failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Vault access failed.
    #[error(transparent)]
    Vault(#[from] VaultError),
    /// The audit entry could not be written; the operation does not count.
    #[error(transparent)]
    Audit(#[from] AuditError),
    /// A remediation intake could not be written.
    #[error(transparent)]
    Intake(#[from] IntakeError),
}

/// How one plan left the executor.
#[derive(Debug)]
pub enum ExecOutcome {
    /// Mutation performed; plan is `executed` in `Plans/completed/`.
    Executed(Plan),
    /// Plan is `failed` in `Plans/failed/` with a remediation intake.
    Failed(Plan),
    /// Dry-run preview recorded; plan re-queued into `Pending_Approval/`
    /// with the `.dryrun` marker for its second approval.
    AwaitingSecondApproval(Plan),
    /// Preview recorded but mutation withheld (`--dry-run`, or `--execute`
    /// not given). Plan remains `approved`.
    DryRunOnly(Plan),
    /// Cancelled cooperatively before upstream dispatch; plan remains
    /// `approved` for a later sweep.
    Cancelled,
}

/// Per-action options from the CLI surface.
#[derive(Debug, Clone, Copy)]
pub struct ExecOptions {
    /// Mutation is only performed when this is set (the `--execute` flag).
    pub execute_enabled: bool,
    /// Stop after the dry-run preview (the `--dry-run` flag).
    pub dry_run_only: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            execute_enabled: false,
            dry_run_only: false,
        }
    }
}

impl ExecOptions {
    /// Options used by the orchestrator sweep.
    pub fn orchestrated() -> Self {
        Self {
            execute_enabled: true,
            dry_run_only: false,
        }
    }
}

type LaneKey = (Channel, String);

/// Channel-agnostic plan executor.
pub struct Executor {
    vault: VaultStore,
    registry: PlanRegistry,
    adapters: AdapterRegistry,
    audit: Arc<AuditLogger>,
    config: ExecutorConfig,
    policy: RetryPolicy,
    // One mutex per (channel, user): at most one execution in flight per
    // pair, parallel across pairs.
    lanes: Mutex<HashMap<LaneKey, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Create an executor over the shared stores.
    pub fn new(
        vault: VaultStore,
        registry: PlanRegistry,
        adapters: AdapterRegistry,
        audit: Arc<AuditLogger>,
        config: ExecutorConfig,
    ) -> Self {
        let policy = RetryPolicy::new(config.retry_base_secs, config.retry_max_attempts);
        Self {
            vault,
            registry,
            adapters,
            audit,
            config,
            policy,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Override the retry policy (tests use millisecond backoffs).
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run one approved plan end to end.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures; every plan-level
    /// outcome is an [`ExecOutcome`].
    pub async fn execute_plan(
        &self,
        plan_id: &str,
        opts: ExecOptions,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ExecOutcome, ExecutorError> {
        let plan = self.registry.get(plan_id).await?;
        let lane = self.lane(plan.channel, &plan.user_id).await;
        let _in_flight = lane.lock().await;

        // Re-read inside the lane: an earlier plan for this pair may have
        // changed the world.
        let plan = self.registry.get(plan_id).await?;

        // ── Step 1: preconditions ───────────────────────────────
        if let Err(detail) = self.verify_preconditions(&plan).await {
            warn!(plan_id = %plan.id, detail = %detail, "plan rejected by preconditions");
            let failed = self
                .fail_plan(&plan, "precondition_error", &detail, None)
                .await?;
            return Ok(ExecOutcome::Failed(failed));
        }
        let adapter = match self.adapters.resolve(plan.channel) {
            Some(adapter) => adapter,
            None => {
                let detail = format!("no adapter for channel {}", plan.channel);
                let failed = self
                    .fail_plan(&plan, "precondition_error", &detail, None)
                    .await?;
                return Ok(ExecOutcome::Failed(failed));
            }
        };

        // ── Step 2: dry-run ─────────────────────────────────────
        let preview = match self.run_dry_run(&plan, adapter.as_ref()).await? {
            Ok(preview) => preview,
            Err(err) => {
                let (kind, detail) = classify(&err);
                let failed = self.fail_plan(&plan, kind, &detail, None).await?;
                return Ok(ExecOutcome::Failed(failed));
            }
        };

        let sensitive = plan.action_type.is_mutating()
            && !self
                .config
                .auto_approve
                .iter()
                .any(|a| a == plan.action_type.as_str());
        if sensitive && !plan.dryrun_approved {
            let requeued = self.requeue_for_second_approval(&plan, &preview).await?;
            return Ok(ExecOutcome::AwaitingSecondApproval(requeued));
        }

        if opts.dry_run_only || !opts.execute_enabled {
            info!(plan_id = %plan.id, "mutation withheld (dry-run only)");
            return Ok(ExecOutcome::DryRunOnly(self.registry.get(&plan.id).await?));
        }

        // ── Step 3: execute with retry ──────────────────────────
        if *cancel.borrow() {
            info!(plan_id = %plan.id, "cancelled before dispatch");
            return Ok(ExecOutcome::Cancelled);
        }

        let started = std::time::Instant::now();
        let attempts_allowed = self.policy.attempts_for(plan.action_type);
        let mut attempt: u32 = 0;
        let outcome = loop {
            attempt = attempt.saturating_add(1);
            match self.call_adapter(&plan, adapter.as_ref()).await {
                Ok(result) => break Ok(result),
                Err(err) if err.is_transient() && attempt < attempts_allowed => {
                    let delay = self.policy.backoff_delay(attempt);
                    warn!(
                        plan_id = %plan.id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    if *cancel.borrow() {
                        // Nothing has been dispatched for the next
                        // attempt: the plan stays approved for a later
                        // sweep.
                        info!(plan_id = %plan.id, "cancelled during retry backoff");
                        return Ok(ExecOutcome::Cancelled);
                    }
                }
                Err(err) => break Err(err),
            }
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(result) => {
                let executed = self
                    .complete_plan(&plan, &preview, &result, duration_ms)
                    .await?;
                Ok(ExecOutcome::Executed(executed))
            }
            Err(err) => {
                let (kind, detail) = classify(&err);
                let failed = self
                    .fail_plan(&plan, kind, &detail, Some(duration_ms))
                    .await?;
                Ok(ExecOutcome::Failed(failed))
            }
        }
    }

    /// Current queue-depth key for backpressure checks.
    pub async fn lane_in_use(&self, channel: Channel, user_id: &str) -> bool {
        let lanes = self.lanes.lock().await;
        lanes
            .get(&(channel, user_id.to_owned()))
            .is_some_and(|lane| lane.try_lock().is_err())
    }

    async fn lane(&self, channel: Channel, user_id: &str) -> Arc<Mutex<()>> {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry((channel, user_id.to_owned()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// The plan file must physically sit in `Approved/`, the registry must
    /// agree on status, the document must carry every mandatory section,
    /// and the action must fit the channel.
    async fn verify_preconditions(&self, plan: &Plan) -> Result<(), String> {
        if plan.status != PlanStatus::Approved {
            return Err(format!("plan status is {}, not approved", plan.status));
        }
        let Some(file_rel) = self.approved_file(plan) else {
            return Err("plan file is not inside Approved/".to_owned());
        };
        if !plan.action_type.belongs_to(plan.channel) {
            return Err(format!(
                "action {} is not in the {} catalog",
                plan.action_type, plan.channel
            ));
        }
        let document = self
            .vault
            .read_to_string(&file_rel)
            .map_err(|e| format!("plan document unreadable: {e}"))?;
        markdown::validate_sections(&document).map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Where the plan file currently sits in `Approved/`, if it does.
    fn approved_file(&self, plan: &Plan) -> Option<String> {
        for name in [plan_file_name(&plan.id), dryrun_file_name(&plan.id)] {
            let rel = format!("{}/{name}", folders::APPROVED);
            if self.vault.exists(&rel) {
                return Some(rel);
            }
        }
        None
    }

    /// Run the dry-run step. The outer error is infrastructure (audit
    /// write); the inner one is the adapter's verdict on the payload.
    async fn run_dry_run(
        &self,
        plan: &Plan,
        adapter: &dyn ChannelAdapter,
    ) -> Result<Result<Preview, AdapterError>, ExecutorError> {
        let started = std::time::Instant::now();
        let timeout = self.action_timeout(plan.action_type);
        let preview = match tokio::time::timeout(
            timeout,
            adapter.dry_run(plan.action_type, &plan.payload),
        )
        .await
        {
            Ok(Ok(preview)) => preview,
            Ok(Err(err)) => return Ok(Err(err)),
            Err(_) => {
                return Ok(Err(AdapterError::Transient(format!(
                    "dry-run timed out after {timeout:?}"
                ))))
            }
        };

        self.audit.log(
            AuditEntry::new(plan.action_type.as_str(), Actor::Ai, AuditResult::DryRun)
                .target(format!("{}:{}", plan.channel, plan.id))
                .parameters(serde_json::json!({"preview": preview.summary}))
                .approval(
                    plan.status.as_str(),
                    plan.approval_ref.clone(),
                    Some(format!("human:{}", plan.user_id)),
                )
                .duration_ms(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)),
        )?;

        // Record the preview into the plan document for the human.
        if let Some(file_rel) = self.approved_file(plan) {
            if let Ok(document) = self.vault.read_to_string(&file_rel) {
                let block = format!("```\n{}\n```", preview.summary);
                if let Ok(updated) = markdown::set_section(&document, "Dry-Run Preview", &block) {
                    let _ = self.vault.write_atomic(&file_rel, updated.as_bytes());
                }
            }
        }
        Ok(Ok(preview))
    }

    /// Re-emit the plan into `Pending_Approval/` with the `.dryrun` marker
    /// and pause until the human moves it to `Approved/` again.
    async fn requeue_for_second_approval(
        &self,
        plan: &Plan,
        preview: &Preview,
    ) -> Result<Plan, ExecutorError> {
        let src = self
            .approved_file(plan)
            .unwrap_or_else(|| format!("{}/{}", folders::APPROVED, plan.file_name()));
        let dst = format!("{}/{}", folders::PENDING_APPROVAL, dryrun_file_name(&plan.id));
        self.vault.rename(&src, &dst)?;

        if let Ok(document) = self.vault.read_to_string(&dst) {
            if let Ok(updated) = markdown::append_entry(
                &document,
                "Approval Trail",
                Utc::now(),
                "dry-run preview recorded; second approval required",
            ) {
                let _ = self.vault.write_atomic(&dst, updated.as_bytes());
            }
        }

        let updated = self
            .registry
            .transition(
                &plan.id,
                PlanStatus::PendingApproval,
                TransitionUpdate {
                    file_path: Some(dst),
                    result: Some(serde_json::json!({
                        "dry_run_preview": {
                            "summary": preview.summary,
                            "details": preview.details,
                        },
                    })),
                    ..TransitionUpdate::default()
                },
            )
            .await?;

        info!(plan_id = %plan.id, "plan re-queued for second approval of dry-run preview");
        Ok(updated)
    }

    async fn call_adapter(
        &self,
        plan: &Plan,
        adapter: &dyn ChannelAdapter,
    ) -> Result<ExecutionResult, AdapterError> {
        let timeout = self.action_timeout(plan.action_type);

        if plan.action_type.is_mutating() {
            match tokio::time::timeout(timeout, adapter.execute(plan.action_type, &plan.payload))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Transient(format!(
                    "execute timed out after {timeout:?}"
                ))),
            }
        } else {
            // Read-only actions run through the adapter's read path.
            let mut query = plan.payload.clone();
            if let Some(obj) = query.as_object_mut() {
                obj.insert(
                    "action".to_owned(),
                    serde_json::json!(plan.action_type.as_str()),
                );
            }
            match tokio::time::timeout(timeout, adapter.list(&query)).await {
                Ok(Ok(value)) => Ok(ExecutionResult {
                    object_id: plan.action_type.as_str().to_owned(),
                    endpoint_used: "list".to_owned(),
                    details: value,
                }),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(AdapterError::Transient(format!(
                    "query timed out after {timeout:?}"
                ))),
            }
        }
    }

    fn action_timeout(&self, action: ActionType) -> Duration {
        let secs = self
            .config
            .action_timeout_secs
            .get(action.as_str())
            .copied()
            .unwrap_or(self.config.timeout_secs);
        Duration::from_secs(secs)
    }

    async fn complete_plan(
        &self,
        plan: &Plan,
        preview: &Preview,
        result: &ExecutionResult,
        duration_ms: u64,
    ) -> Result<Plan, ExecutorError> {
        let src = self
            .approved_file(plan)
            .unwrap_or_else(|| format!("{}/{}", folders::APPROVED, plan.file_name()));
        let dst = format!("{}/{}", folders::PLANS_COMPLETED, plan.file_name());

        if let Ok(document) = self.vault.read_to_string(&src) {
            if let Ok(updated) = markdown::append_entry(
                &document,
                "Execution Log",
                Utc::now(),
                &format!(
                    "executed via {} -> {} ({duration_ms} ms)",
                    result.endpoint_used, result.object_id
                ),
            ) {
                let _ = self.vault.write_atomic(&src, updated.as_bytes());
            }
        }
        self.vault.rename(&src, &dst)?;

        let updated = self
            .registry
            .transition(
                &plan.id,
                PlanStatus::Executed,
                TransitionUpdate {
                    file_path: Some(dst),
                    result: Some(serde_json::json!({
                        "dry_run_preview": {"summary": preview.summary},
                        "execution": {
                            "object_id": result.object_id,
                            "endpoint_used": result.endpoint_used,
                            "details": result.details,
                        },
                    })),
                    ..TransitionUpdate::default()
                },
            )
            .await?;

        self.audit.log(
            AuditEntry::new(plan.action_type.as_str(), Actor::Ai, AuditResult::Ok)
                .target(format!("{}:{}", plan.channel, result.object_id))
                .parameters(plan.payload.clone())
                .approval(
                    "approved",
                    plan.approval_ref.clone(),
                    Some(format!("human:{}", plan.user_id)),
                )
                .duration_ms(duration_ms),
        )?;

        info!(plan_id = %plan.id, object_id = %result.object_id, "plan executed");
        Ok(updated)
    }

    /// Terminal failure: move the file, record the outcome, file a
    /// remediation intake. Never synthesizes success.
    async fn fail_plan(
        &self,
        plan: &Plan,
        kind: &str,
        detail: &str,
        duration_ms: Option<u64>,
    ) -> Result<Plan, ExecutorError> {
        if let Some(src) = self.approved_file(plan) {
            let dst = format!("{}/{}", folders::PLANS_FAILED, plan.file_name());
            if let Err(e) = self.vault.rename(&src, &dst) {
                warn!(plan_id = %plan.id, error = %e, "failed to move plan file to failed folder");
            }
        }

        let updated = self
            .registry
            .transition(
                &plan.id,
                PlanStatus::Failed,
                TransitionUpdate {
                    file_path: Some(format!("{}/{}", folders::PLANS_FAILED, plan.file_name())),
                    result: Some(serde_json::json!({"kind": kind, "detail": detail})),
                    ..TransitionUpdate::default()
                },
            )
            .await?;

        intake::write_remediation(
            &self.vault,
            plan.channel.as_str(),
            &format!("{} plan {} failed", plan.channel, plan.id),
            &format!(
                "Plan {} ({} on {}) failed with {kind}: {detail}. Review the plan \
                 under Plans/failed/ and re-draft once the cause is resolved.",
                plan.id, plan.action_type, plan.channel
            ),
            Utc::now(),
        )?;

        let mut entry = AuditEntry::new(plan.action_type.as_str(), Actor::Ai, AuditResult::Error)
            .target(format!("{}:{}", plan.channel, plan.id))
            .approval(
                "approved",
                plan.approval_ref.clone(),
                Some(format!("human:{}", plan.user_id)),
            )
            .error_detail(format!("{kind}: {detail}"));
        if let Some(ms) = duration_ms {
            entry = entry.duration_ms(ms);
        }
        self.audit.log(entry)?;

        warn!(plan_id = %plan.id, kind, "plan failed");
        Ok(updated)
    }
}

/// Map an adapter error to its §7-style kind string and detail.
fn classify(err: &AdapterError) -> (&'static str, String) {
    match err {
        AdapterError::Auth(d) => ("auth_error", d.clone()),
        AdapterError::Transient(d) => ("transient_error", d.clone()),
        AdapterError::Permanent(d) => ("permanent_upstream_error", d.clone()),
        AdapterError::Validation(d) => ("precondition_error", d.clone()),
        AdapterError::NotSupported { .. } => ("precondition_error", err.to_string()),
    }
}
