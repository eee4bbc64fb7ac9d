//! Bounded autonomy loop: capped plan generation that never self-approves.
//!
//! Given a proposer (the reasoning collaborator behind a narrow trait),
//! the loop iterates at most N times, creating at most K plans per
//! iteration. Read-only plans execute immediately; the moment any
//! proposed plan requires approval the loop halts; remaining iterations
//! are not run, and the halt is audited exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::audit::{Actor, AuditEntry, AuditLogger, AuditResult};
use crate::config::AutonomyConfig;
use crate::executor::{ExecOptions, Executor};
use crate::intake;
use crate::plan::lifecycle;
use crate::plan::markdown::PlanNarrative;
use crate::plan::registry::{PlanRegistry, TransitionUpdate};
use crate::plan::{ActionType, Channel, Plan, PlanStatus, RiskLevel};
use crate::vault::{folders, VaultStore};

/// Hard iteration cap, regardless of configuration.
pub const HARD_ITERATION_CAP: u32 = 50;

/// One plan the proposer wants created.
#[derive(Debug, Clone)]
pub struct ProposedPlan {
    /// Target channel.
    pub channel: Channel,
    /// Action to perform.
    pub action_type: ActionType,
    /// Action payload.
    pub payload: serde_json::Value,
    /// Risk classification.
    pub risk_level: RiskLevel,
    /// Id slug.
    pub slug: String,
    /// Human-facing narrative sections.
    pub narrative: PlanNarrative,
}

/// The reasoning collaborator behind a narrow seam. Implementations may
/// call a content model; the core only sees proposals.
#[async_trait]
pub trait PlanProposer: Send + Sync {
    /// Propose plans for this iteration. An empty proposal ends the loop.
    async fn propose(&self, iteration: u32) -> anyhow::Result<Vec<ProposedPlan>>;
}

/// Proposer that never proposes; the default when no collaborator is
/// wired.
#[derive(Debug, Default)]
pub struct NullProposer;

#[async_trait]
impl PlanProposer for NullProposer {
    async fn propose(&self, _iteration: u32) -> anyhow::Result<Vec<ProposedPlan>> {
        Ok(Vec::new())
    }
}

/// What a loop run did.
#[derive(Debug, Clone, Default)]
pub struct AutonomyReport {
    /// Iterations actually run.
    pub iterations_run: u32,
    /// Plans created in total.
    pub plans_created: u32,
    /// Read-only plans executed immediately.
    pub executed_read_only: u32,
    /// Whether the loop halted because a plan requires approval.
    pub halted_on_approval: bool,
}

/// Dependencies for one loop run.
pub struct AutonomyDeps {
    /// Vault handle.
    pub vault: VaultStore,
    /// Plan registry.
    pub registry: PlanRegistry,
    /// Executor for read-only plans.
    pub executor: Arc<Executor>,
    /// Audit logger.
    pub audit: Arc<AuditLogger>,
    /// Owner user id stamped on created plans.
    pub user_id: String,
}

impl std::fmt::Debug for AutonomyDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutonomyDeps")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// Run the bounded loop.
///
/// # Errors
///
/// Returns an error only for infrastructure failures; proposer failures
/// emit a remediation intake and end the loop.
pub async fn run(
    deps: &AutonomyDeps,
    proposer: &dyn PlanProposer,
    config: &AutonomyConfig,
) -> anyhow::Result<AutonomyReport> {
    let max_iterations = config.max_iterations.min(HARD_ITERATION_CAP).max(1);
    let mut report = AutonomyReport::default();

    'outer: for iteration in 1..=max_iterations {
        report.iterations_run = iteration;

        let proposals = match proposer.propose(iteration).await {
            Ok(proposals) => proposals,
            Err(e) => {
                warn!(iteration, error = %e, "autonomy proposer failed");
                intake::write_remediation(
                    &deps.vault,
                    "autonomy",
                    "autonomy loop stopped by proposer failure",
                    &format!("Iteration {iteration} failed: {e}."),
                    Utc::now(),
                )?;
                deps.audit.log(
                    AuditEntry::new("autonomy_iteration", Actor::Ai, AuditResult::Error)
                        .error_detail(e.to_string()),
                )?;
                break;
            }
        };
        if proposals.is_empty() {
            info!(iteration, "autonomy loop finished: nothing proposed");
            break;
        }

        let capped = proposals
            .into_iter()
            .take(usize::try_from(config.max_plans_per_iteration).unwrap_or(usize::MAX))
            .collect::<Vec<_>>();

        for proposal in capped {
            let plan = Plan::new_draft(
                deps.user_id.clone(),
                proposal.channel,
                proposal.action_type,
                proposal.payload,
                proposal.risk_level,
                &proposal.slug,
            );
            let plan = lifecycle::create_draft(
                &deps.vault,
                &deps.registry,
                &deps.audit,
                plan,
                &proposal.narrative,
                Actor::Ai,
            )
            .await?;
            let plan = lifecycle::submit_for_approval(
                &deps.vault,
                &deps.registry,
                &deps.audit,
                &plan.id,
                Actor::Ai,
            )
            .await?;
            report.plans_created = report.plans_created.saturating_add(1);

            if plan.action_type.is_mutating() {
                // The plan sits in Pending_Approval/ awaiting a human.
                // The loop must halt here; it never self-approves.
                deps.audit.log(
                    AuditEntry::new(
                        "autonomy_halt_pending_approval",
                        Actor::Ai,
                        AuditResult::Ok,
                    )
                    .target(format!("{}:{}", plan.channel, plan.id))
                    .approval("pending_approval", None, None),
                )?;
                info!(
                    iteration,
                    plan_id = %plan.id,
                    "autonomy loop halted: plan requires approval"
                );
                report.halted_on_approval = true;
                break 'outer;
            }

            // Read-only: no human approval is required, so the loop may
            // move the file itself and execute immediately.
            let name = plan.file_name();
            deps.vault.rename(
                format!("{}/{name}", folders::PENDING_APPROVAL),
                format!("{}/{name}", folders::APPROVED),
            )?;
            deps.registry
                .transition(
                    &plan.id,
                    PlanStatus::Approved,
                    TransitionUpdate {
                        approval_ref: Some("auto:read-only".to_owned()),
                        file_path: Some(format!("{}/{name}", folders::APPROVED)),
                        ..TransitionUpdate::default()
                    },
                )
                .await?;

            let cancel = {
                let (_tx, rx) = tokio::sync::watch::channel(false);
                rx
            };
            deps.executor
                .execute_plan(&plan.id, ExecOptions::orchestrated(), &cancel)
                .await?;
            report.executed_read_only = report.executed_read_only.saturating_add(1);
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::MockAdapter;
    use crate::adapters::AdapterRegistry;
    use crate::config::ExecutorConfig;
    use std::sync::Mutex;

    /// Proposer that plays back a script of per-iteration proposals.
    struct ScriptedProposer {
        script: Mutex<Vec<Vec<ProposedPlan>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedProposer {
        fn new(script: Vec<Vec<ProposedPlan>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().expect("lock")
        }
    }

    #[async_trait]
    impl PlanProposer for ScriptedProposer {
        async fn propose(&self, _iteration: u32) -> anyhow::Result<Vec<ProposedPlan>> {
            let mut calls = self.calls.lock().expect("lock");
            *calls = calls.saturating_add(1);
            let mut script = self.script.lock().expect("lock");
            if script.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(script.remove(0))
            }
        }
    }

    fn read_only_proposal() -> ProposedPlan {
        ProposedPlan {
            channel: Channel::Odoo,
            action_type: ActionType::ListInvoices,
            payload: serde_json::json!({"unpaid_only": true}),
            risk_level: RiskLevel::Low,
            slug: "unpaid-check".to_owned(),
            narrative: PlanNarrative::default(),
        }
    }

    fn mutating_proposal() -> ProposedPlan {
        ProposedPlan {
            channel: Channel::Gmail,
            action_type: ActionType::SendEmail,
            payload: serde_json::json!({"to": "a@b.com", "subject": "s", "body": "b"}),
            risk_level: RiskLevel::Medium,
            slug: "followup".to_owned(),
            narrative: PlanNarrative::default(),
        }
    }

    async fn deps() -> (tempfile::TempDir, AutonomyDeps) {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::init(dir.path()).expect("vault");
        let registry = PlanRegistry::open_in_memory().await.expect("registry");
        let audit = Arc::new(AuditLogger::new(vault.clone()));
        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(MockAdapter::succeeding(Channel::Odoo)));
        adapters.register(Arc::new(MockAdapter::succeeding(Channel::Gmail)));
        let executor = Arc::new(Executor::new(
            vault.clone(),
            registry.clone(),
            adapters,
            Arc::clone(&audit),
            ExecutorConfig::default(),
        ));
        (
            dir,
            AutonomyDeps {
                vault,
                registry,
                executor,
                audit,
                user_id: "owner".to_owned(),
            },
        )
    }

    #[tokio::test]
    async fn test_halts_when_plan_requires_approval() {
        let (_dir, deps) = deps().await;
        // Iteration 1: read-only. Iteration 2: mutating. Iterations 3+:
        // would propose more, but must never be reached.
        let proposer = ScriptedProposer::new(vec![
            vec![read_only_proposal()],
            vec![mutating_proposal()],
            vec![read_only_proposal()],
        ]);
        let config = AutonomyConfig {
            enabled: true,
            max_iterations: 10,
            max_plans_per_iteration: 5,
        };

        let report = run(&deps, &proposer, &config).await.expect("run");

        assert_eq!(report.iterations_run, 2, "halted at iteration 2");
        assert_eq!(proposer.calls(), 2, "iterations 3-10 never ran");
        assert!(report.halted_on_approval);
        assert_eq!(report.executed_read_only, 1);

        // The mutating plan waits in Pending_Approval/, unapproved.
        let pending = deps
            .registry
            .list_by_status(PlanStatus::PendingApproval)
            .await
            .expect("list");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action_type, ActionType::SendEmail);

        // Exactly one halt entry in today's audit log.
        let partition = format!("Logs/{}.json", Utc::now().format("%Y-%m-%d"));
        let log = deps.vault.read_to_string(&partition).expect("log");
        let halts = log
            .lines()
            .filter(|l| l.contains("autonomy_halt_pending_approval"))
            .count();
        assert_eq!(halts, 1);
    }

    #[tokio::test]
    async fn test_read_only_plans_execute_immediately() {
        let (_dir, deps) = deps().await;
        let proposer = ScriptedProposer::new(vec![vec![read_only_proposal()]]);
        let config = AutonomyConfig {
            enabled: true,
            max_iterations: 3,
            max_plans_per_iteration: 5,
        };

        let report = run(&deps, &proposer, &config).await.expect("run");
        assert!(!report.halted_on_approval);
        assert_eq!(report.executed_read_only, 1);

        let executed = deps
            .registry
            .list_by_status(PlanStatus::Executed)
            .await
            .expect("list");
        assert_eq!(executed.len(), 1);
    }

    #[tokio::test]
    async fn test_plans_per_iteration_capped() {
        let (_dir, deps) = deps().await;
        let proposals = ["check-1", "check-2", "check-3"]
            .into_iter()
            .map(|slug| ProposedPlan {
                slug: slug.to_owned(),
                ..read_only_proposal()
            })
            .collect();
        let proposer = ScriptedProposer::new(vec![proposals]);
        let config = AutonomyConfig {
            enabled: true,
            max_iterations: 1,
            max_plans_per_iteration: 2,
        };

        let report = run(&deps, &proposer, &config).await.expect("run");
        assert_eq!(report.plans_created, 2, "third proposal dropped by cap");
    }

    #[tokio::test]
    async fn test_hard_cap_bounds_configured_iterations() {
        let (_dir, deps) = deps().await;
        // Endless empty proposals: the loop ends on the first empty set,
        // but the bound must still clamp.
        let proposer = NullProposer;
        let config = AutonomyConfig {
            enabled: true,
            max_iterations: 10_000,
            max_plans_per_iteration: 1,
        };
        let report = run(&deps, &proposer, &config).await.expect("run");
        assert!(report.iterations_run <= HARD_ITERATION_CAP);
    }
}
