//! The daily cycle: briefing, accounting audit, and the bounded autonomy
//! loop halting at the first approval-requiring plan.

use std::sync::Arc;

use adjutant::adapters::mock::MockAdapter;
use adjutant::adapters::AdapterRegistry;
use adjutant::audit::AuditLogger;
use adjutant::config::Config;
use adjutant::executor::Executor;
use adjutant::orchestrator::autonomy::{PlanProposer, ProposedPlan};
use adjutant::orchestrator::Orchestrator;
use adjutant::plan::markdown::PlanNarrative;
use adjutant::plan::registry::PlanRegistry;
use adjutant::plan::{ActionType, Channel, PlanStatus, RiskLevel};
use adjutant::vault::VaultStore;
use async_trait::async_trait;
use tokio::sync::watch;

/// Proposes one read-only plan, then one mutating plan, then keeps
/// proposing forever; the loop must never reach the third call.
struct TwoPhaseProposer;

#[async_trait]
impl PlanProposer for TwoPhaseProposer {
    async fn propose(&self, iteration: u32) -> anyhow::Result<Vec<ProposedPlan>> {
        match iteration {
            1 => Ok(vec![ProposedPlan {
                channel: Channel::Odoo,
                action_type: ActionType::ListInvoices,
                payload: serde_json::json!({"unpaid_only": true}),
                risk_level: RiskLevel::Low,
                slug: "morning-check".to_owned(),
                narrative: PlanNarrative::default(),
            }]),
            _ => Ok(vec![ProposedPlan {
                channel: Channel::Gmail,
                action_type: ActionType::SendEmail,
                payload: serde_json::json!({
                    "to": "client@example.com", "subject": "chase", "body": "ping",
                }),
                risk_level: RiskLevel::Medium,
                slug: format!("chase-{iteration}"),
                narrative: PlanNarrative::default(),
            }]),
        }
    }
}

struct World {
    _dir: tempfile::TempDir,
    orchestrator: Orchestrator,
    vault: VaultStore,
    registry: PlanRegistry,
}

async fn world() -> World {
    let dir = tempfile::tempdir().expect("tempdir");
    let vault = VaultStore::init(dir.path().join("vault")).expect("vault");
    let registry = PlanRegistry::open_in_memory().await.expect("registry");
    let audit = Arc::new(AuditLogger::new(vault.clone()));

    let mut config = Config::default();
    config.adapters.state_dir = dir.path().join("state");
    config.orchestrator.ready_dir = dir.path().join("ready");
    // Fire the daily cycle on every tick.
    config.orchestrator.daily_cycle_cron = "* * * * * *".to_owned();
    config.orchestrator.autonomy.enabled = true;
    config.orchestrator.autonomy.max_iterations = 10;
    config.watchers.filesystem.enabled = false;
    config.watchers.gmail.enabled = false;
    config.watchers.whatsapp.enabled = false;
    config.watchers.linkedin.enabled = false;
    config.watchers.instagram.enabled = false;
    config.watchers.odoo.enabled = false;
    std::fs::create_dir_all(&config.orchestrator.ready_dir).expect("ready dir");
    let config = Arc::new(config);

    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(MockAdapter::succeeding(Channel::Odoo)));
    adapters.register(Arc::new(MockAdapter::succeeding(Channel::Gmail)));

    let executor = Arc::new(Executor::new(
        vault.clone(),
        registry.clone(),
        adapters.clone(),
        Arc::clone(&audit),
        config.executor.clone(),
    ));

    let orchestrator = Orchestrator::from_parts(
        Arc::clone(&config),
        vault.clone(),
        registry.clone(),
        adapters,
        executor,
        audit,
    )
    .with_proposer(Arc::new(TwoPhaseProposer));

    World {
        _dir: dir,
        orchestrator,
        vault,
        registry,
    }
}

#[tokio::test]
async fn daily_cycle_produces_artifacts_and_halts_autonomy_at_approval() {
    let mut w = world().await;
    let (_tx, cancel) = watch::channel(false);

    let report = w.orchestrator.tick(&cancel).await.expect("tick");
    assert!(report.daily_cycle_ran);

    // Briefing and accounting audit exist.
    let today = chrono::Utc::now().format("%Y-%m-%d");
    assert!(w
        .vault
        .exists(format!("Business/Briefings/briefing__{today}.md")));
    assert!(w
        .vault
        .exists(format!("Business/Accounting/audit__{today}.md")));

    // The autonomy loop executed the read-only plan and halted on the
    // mutating one.
    let executed = w
        .registry
        .list_by_status(PlanStatus::Executed)
        .await
        .expect("list");
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].action_type, ActionType::ListInvoices);

    let pending = w
        .registry
        .list_by_status(PlanStatus::PendingApproval)
        .await
        .expect("list");
    assert_eq!(pending.len(), 1, "the mutating plan awaits a human");
    assert_eq!(pending[0].action_type, ActionType::SendEmail);

    let partition = format!("Logs/{today}.json");
    let log = w.vault.read_to_string(&partition).expect("log");
    let halts = log
        .lines()
        .filter(|l| l.contains("autonomy_halt_pending_approval"))
        .count();
    assert_eq!(halts, 1, "exactly one halt entry");
}
