//! Orchestrator: the scheduled driver that wires the pipeline together.
//!
//! Each tick runs due watchers, folds approval-folder moves into the
//! registry, sweeps `Approved/` into the executor (parallel across
//! `(channel, user)` lanes, FIFO within one), archives terminal plans,
//! and, at the configured time, runs the daily cycle: briefing,
//! accounting audit, audit retention, and the bounded autonomy loop.

pub mod autonomy;
pub mod briefing;
pub mod status;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::adapters::AdapterRegistry;
use crate::audit::{Actor, AuditEntry, AuditLogger, AuditResult};
use crate::config::Config;
use crate::executor::{ExecOptions, Executor};
use crate::plan::registry::{PlanRegistry, ReconcileEvent, TransitionUpdate};
use crate::plan::{Channel, PlanStatus};
use crate::vault::VaultStore;
use crate::watchers::{
    self, filesystem::FilesystemWatcher, gmail::GmailWatcher, instagram::InstagramWatcher,
    linkedin::LinkedInWatcher, odoo::OdooWatcher, whatsapp::WhatsAppWatcher, Watcher,
    WatcherContext,
};

use autonomy::{NullProposer, PlanProposer};

/// What one tick did (observability and tests).
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Watchers run this tick.
    pub watchers_run: usize,
    /// Approval-folder events observed.
    pub approval_events: usize,
    /// Plans dispatched to the executor.
    pub dispatched: usize,
    /// Terminal plans archived.
    pub archived: usize,
    /// Whether the daily cycle ran.
    pub daily_cycle_ran: bool,
}

/// The scheduled driver.
pub struct Orchestrator {
    config: Arc<Config>,
    vault: VaultStore,
    registry: PlanRegistry,
    adapters: AdapterRegistry,
    executor: Arc<Executor>,
    audit: Arc<AuditLogger>,
    watcher_ctx: WatcherContext,
    enabled_watchers: Vec<(Box<dyn Watcher>, Duration)>,
    last_watcher_runs: HashMap<String, Instant>,
    last_daily_run: Option<DateTime<Utc>>,
    proposer: Arc<dyn PlanProposer>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("watchers", &self.enabled_watchers.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Assemble the orchestrator from already-built parts.
    pub fn from_parts(
        config: Arc<Config>,
        vault: VaultStore,
        registry: PlanRegistry,
        adapters: AdapterRegistry,
        executor: Arc<Executor>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let watcher_ctx = WatcherContext {
            vault: vault.clone(),
            audit: Arc::clone(&audit),
            adapters: adapters.clone(),
            checkpoints_dir: config.checkpoints_dir(),
            ready_dir: config.orchestrator.ready_dir.clone(),
        };

        let w = &config.watchers;
        let mut enabled_watchers: Vec<(Box<dyn Watcher>, Duration)> = Vec::new();
        if w.filesystem.enabled {
            enabled_watchers.push((
                Box::new(FilesystemWatcher),
                Duration::from_secs(w.filesystem.interval_secs),
            ));
        }
        if w.gmail.enabled {
            let query = w.gmail.query.clone().unwrap_or_else(|| "is:unread".to_owned());
            enabled_watchers.push((
                Box::new(GmailWatcher::new(query)),
                Duration::from_secs(w.gmail.interval_secs),
            ));
        }
        if w.whatsapp.enabled {
            enabled_watchers.push((
                Box::new(WhatsAppWatcher),
                Duration::from_secs(w.whatsapp.interval_secs),
            ));
        }
        if w.linkedin.enabled {
            enabled_watchers.push((
                Box::new(LinkedInWatcher),
                Duration::from_secs(w.linkedin.interval_secs),
            ));
        }
        if w.instagram.enabled {
            enabled_watchers.push((
                Box::new(InstagramWatcher),
                Duration::from_secs(w.instagram.interval_secs),
            ));
        }
        if w.odoo.enabled {
            enabled_watchers.push((
                Box::new(OdooWatcher),
                Duration::from_secs(w.odoo.interval_secs),
            ));
        }

        Self {
            config,
            vault,
            registry,
            adapters,
            executor,
            audit,
            watcher_ctx,
            enabled_watchers,
            last_watcher_runs: HashMap::new(),
            last_daily_run: None,
            proposer: Arc::new(NullProposer),
        }
    }

    /// Wire a reasoning collaborator into the autonomy loop.
    #[must_use]
    pub fn with_proposer(mut self, proposer: Arc<dyn PlanProposer>) -> Self {
        self.proposer = proposer;
        self
    }

    /// Run until the shutdown signal flips.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(tick_secs = self.config.orchestrator.tick_secs, "orchestrator started");
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.orchestrator.tick_secs));
        let cancel = shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick(&cancel).await {
                        Ok(report) => {
                            if report.dispatched > 0 || report.approval_events > 0 {
                                info!(
                                    dispatched = report.dispatched,
                                    approvals = report.approval_events,
                                    archived = report.archived,
                                    "orchestrator tick"
                                );
                            }
                        }
                        Err(e) => error!(error = %e, "orchestrator tick failed"),
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("orchestrator shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full orchestrator iteration.
    ///
    /// # Errors
    ///
    /// Returns an error on infrastructure failure; individual component
    /// failures are isolated and logged.
    pub async fn tick(&mut self, cancel: &watch::Receiver<bool>) -> anyhow::Result<TickReport> {
        let mut report = TickReport::default();

        report.watchers_run = self.run_due_watchers().await;
        report.approval_events = self.scan_approvals().await?;
        report.dispatched = self.sweep_approved(cancel).await?;
        report.archived = self.sweep_terminal().await?;
        report.daily_cycle_ran = self.maybe_run_daily_cycle().await?;

        self.write_status().await;
        watchers::touch_ready(&self.config.orchestrator.ready_dir, "orchestrator");
        Ok(report)
    }

    /// Run every enabled watcher whose interval has elapsed.
    async fn run_due_watchers(&mut self) -> usize {
        let mut run = 0usize;
        for (watcher, interval) in &self.enabled_watchers {
            let name = watcher.name().to_owned();
            let due = self
                .last_watcher_runs
                .get(&name)
                .is_none_or(|last| last.elapsed() >= *interval);
            if !due {
                continue;
            }
            match watchers::run_once(watcher.as_ref(), &self.watcher_ctx).await {
                Ok(outcome) => {
                    if outcome.created > 0 {
                        info!(watcher = %name, created = outcome.created, "watcher produced intakes");
                    }
                }
                Err(e) => {
                    // Watcher failures are isolated; the next cadence
                    // retries.
                    warn!(watcher = %name, error = %e, "watcher run failed");
                }
            }
            self.last_watcher_runs.insert(name, Instant::now());
            run = run.saturating_add(1);
        }
        run
    }

    /// Fold human file moves into the registry and audit each decision.
    async fn scan_approvals(&self) -> anyhow::Result<usize> {
        let user = &self.config.orchestrator.user_id;
        let events = self.registry.reconcile(&self.vault).await?;
        for event in &events {
            match event {
                ReconcileEvent::Approved {
                    id,
                    second_round,
                    approval_ref,
                } => {
                    self.audit.log(
                        AuditEntry::new("approve", Actor::Human(user.clone()), AuditResult::Ok)
                            .target(id.clone())
                            .approval(
                                "approved",
                                Some(approval_ref.clone()),
                                Some(format!("human:{user}")),
                            )
                            .parameters(serde_json::json!({"second_round": second_round})),
                    )?;
                }
                ReconcileEvent::Rejected { id } => {
                    self.audit.log(
                        AuditEntry::new("reject", Actor::Human(user.clone()), AuditResult::Ok)
                            .target(id.clone())
                            .approval("rejected", None, Some(format!("human:{user}"))),
                    )?;
                }
                ReconcileEvent::Conflict { id } => {
                    warn!(plan_id = %id, "plan in both Approved/ and Rejected/; execution refused");
                    self.audit.log(
                        AuditEntry::new(
                            "approval_conflict",
                            Actor::Orchestrator,
                            AuditResult::Degraded,
                        )
                        .target(id.clone())
                        .error_detail("file present in both Approved/ and Rejected/"),
                    )?;
                }
                ReconcileEvent::MissingFile { id } => {
                    warn!(plan_id = %id, "pending plan file missing");
                }
            }
        }
        Ok(events.len())
    }

    /// Dispatch approved plans: parallel across lanes, FIFO within one.
    async fn sweep_approved(&self, cancel: &watch::Receiver<bool>) -> anyhow::Result<usize> {
        let now = Utc::now();
        let approved = self.registry.list_by_status(PlanStatus::Approved).await?;
        let ready: Vec<_> = approved
            .into_iter()
            .filter(|p| p.scheduled_at.is_none_or(|at| at <= now))
            .collect();
        if ready.is_empty() {
            return Ok(0);
        }

        // Group FIFO (list is created_at-ordered) by lane.
        let mut lanes: HashMap<(Channel, String), Vec<String>> = HashMap::new();
        for plan in ready {
            lanes
                .entry((plan.channel, plan.user_id.clone()))
                .or_default()
                .push(plan.id);
        }

        let soft_bound = self.config.executor.queue_soft_bound;
        let mut dispatched = 0usize;
        let mut join_set: JoinSet<()> = JoinSet::new();

        for ((channel, user_id), plan_ids) in lanes {
            if plan_ids.len() > soft_bound {
                warn!(
                    channel = %channel,
                    user_id = %user_id,
                    queued = plan_ids.len(),
                    "lane over soft bound; dispatch paused"
                );
                self.audit.log(
                    AuditEntry::new("backpressure", Actor::Orchestrator, AuditResult::Degraded)
                        .target(format!("{channel}:{user_id}"))
                        .parameters(serde_json::json!({
                            "kind": "concurrency_error",
                            "queued": plan_ids.len(),
                            "soft_bound": soft_bound,
                        })),
                )?;
                continue;
            }

            dispatched = dispatched.saturating_add(plan_ids.len());
            let executor = Arc::clone(&self.executor);
            let cancel = cancel.clone();
            join_set.spawn(async move {
                for plan_id in plan_ids {
                    if *cancel.borrow() {
                        break;
                    }
                    if let Err(e) = executor
                        .execute_plan(&plan_id, ExecOptions::orchestrated(), &cancel)
                        .await
                    {
                        error!(plan_id = %plan_id, error = %e, "executor infrastructure failure");
                        break;
                    }
                }
            });
        }

        while join_set.join_next().await.is_some() {}
        Ok(dispatched)
    }

    /// Mark terminal plans archived once their file rests in its terminal
    /// folder.
    async fn sweep_terminal(&self) -> anyhow::Result<usize> {
        let mut archived = 0usize;
        for terminal in [PlanStatus::Executed, PlanStatus::Failed, PlanStatus::Rejected] {
            for plan in self.registry.list_by_status(terminal).await? {
                let Some(folder) = terminal.expected_folder() else {
                    continue;
                };
                let in_place = self
                    .vault
                    .exists(format!("{folder}/{}", plan.file_name()))
                    || plan
                        .file_path
                        .as_deref()
                        .is_some_and(|p| p.starts_with(folder) && self.vault.exists(p));
                if !in_place {
                    warn!(plan_id = %plan.id, status = %terminal, "terminal plan file not in expected folder");
                    continue;
                }
                self.registry
                    .transition(&plan.id, PlanStatus::Archived, TransitionUpdate::default())
                    .await?;
                archived = archived.saturating_add(1);
            }
        }
        Ok(archived)
    }

    /// Run the daily cycle when the cron expression has fired since the
    /// last run.
    async fn maybe_run_daily_cycle(&mut self) -> anyhow::Result<bool> {
        let expr = &self.config.orchestrator.daily_cycle_cron;
        let schedule = match cron::Schedule::from_str(expr) {
            Ok(s) => s,
            Err(e) => {
                warn!(cron = %expr, error = %e, "invalid daily-cycle cron; skipping");
                return Ok(false);
            }
        };
        let now = Utc::now();
        let after = self.last_daily_run.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let due = schedule.after(&after).take(1).any(|next| next <= now);
        if !due {
            return Ok(false);
        }
        self.last_daily_run = Some(now);
        info!("daily cycle starting");

        if let Err(e) = briefing::write_briefing(&self.vault, &self.registry).await {
            warn!(error = %e, "briefing generation failed");
        }
        if let Err(e) = briefing::write_accounting_audit(&self.vault, &self.adapters).await {
            warn!(error = %e, "accounting audit failed");
        }
        match self
            .audit
            .archive_older_than(self.config.audit.retention_days)
        {
            Ok(0) => {}
            Ok(n) => info!(archived = n, "audit partitions archived"),
            Err(e) => warn!(error = %e, "audit retention archival failed"),
        }

        if self.config.orchestrator.autonomy.enabled {
            let deps = autonomy::AutonomyDeps {
                vault: self.vault.clone(),
                registry: self.registry.clone(),
                executor: Arc::clone(&self.executor),
                audit: Arc::clone(&self.audit),
                user_id: self.config.orchestrator.user_id.clone(),
            };
            match autonomy::run(
                &deps,
                self.proposer.as_ref(),
                &self.config.orchestrator.autonomy,
            )
            .await
            {
                Ok(loop_report) => info!(
                    iterations = loop_report.iterations_run,
                    plans = loop_report.plans_created,
                    halted = loop_report.halted_on_approval,
                    "autonomy loop finished"
                ),
                Err(e) => warn!(error = %e, "autonomy loop failed"),
            }
        }
        Ok(true)
    }

    async fn write_status(&self) {
        let names: Vec<&str> = self
            .enabled_watchers
            .iter()
            .map(|(w, _)| w.name())
            .collect();
        match status::SystemStatus::collect(&self.registry, &self.watcher_ctx.checkpoints_dir, &names)
            .await
        {
            Ok(snapshot) => {
                if let Err(e) = snapshot.write(&self.vault) {
                    warn!(error = %e, "failed to write system status");
                }
            }
            Err(e) => warn!(error = %e, "failed to collect system status"),
        }
    }
}
