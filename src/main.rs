#![allow(missing_docs)]

//! Adjutant CLI: orchestrator, standalone watcher and executor runs, and
//! vault scaffolding.
//!
//! Exit codes: `0` success, `1` partial (some items errored, none fatal),
//! `2` fatal configuration error, `3` upstream authentication error,
//! `4` cancelled.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use adjutant::adapters::{AdapterMode, AdapterRegistry};
use adjutant::audit::redactor::PiiRedactor;
use adjutant::audit::AuditLogger;
use adjutant::config::Config;
use adjutant::credentials::SecretsDir;
use adjutant::executor::{ExecOptions, ExecOutcome, Executor};
use adjutant::orchestrator::{status::STATUS_FILE, Orchestrator};
use adjutant::plan::registry::PlanRegistry;
use adjutant::plan::PlanStatus;
use adjutant::vault::VaultStore;
use adjutant::watchers::{
    self, filesystem::FilesystemWatcher, gmail::GmailWatcher, instagram::InstagramWatcher,
    linkedin::LinkedInWatcher, odoo::OdooWatcher, whatsapp::WhatsAppWatcher, Watcher,
    WatcherContext,
};
use adjutant::logging;

const EXIT_OK: u8 = 0;
const EXIT_PARTIAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_AUTH: u8 = 3;
const EXIT_CANCELLED: u8 = 4;

#[derive(Debug, Parser)]
#[command(name = "adjutant", version, about = "Personal AI-employee runtime")]
struct Cli {
    /// Override the vault root.
    #[arg(long, global = true)]
    vault: Option<PathBuf>,

    /// Adapter mode: `mock` (synthetic data) or `real` (live APIs).
    #[arg(long, global = true)]
    mode: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scaffold the vault tree, state directory, and secrets directory.
    Init,
    /// Run the orchestrator until signalled.
    Start {
        /// Seconds between orchestrator ticks.
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Run one watcher standalone.
    Watch {
        /// Source: filesystem, gmail, whatsapp, linkedin, instagram, odoo.
        source: String,
        /// Run one iteration and exit (the default).
        #[arg(long)]
        once: bool,
        /// Run in a loop until signalled.
        #[arg(long = "loop")]
        run_loop: bool,
        /// Iteration delay in seconds (loop mode).
        #[arg(long)]
        interval: Option<u64>,
        /// Preview: list what would be wrapped, write nothing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Sweep `Approved/` and run the executor.
    Execute {
        /// Run one sweep and exit (the default).
        #[arg(long)]
        once: bool,
        /// Run in a loop until signalled.
        #[arg(long = "loop")]
        run_loop: bool,
        /// Iteration delay in seconds (loop mode).
        #[arg(long)]
        interval: Option<u64>,
        /// Stop after dry-run previews; perform no mutation.
        #[arg(long)]
        dry_run: bool,
        /// Opt in to mutation (required for any write).
        #[arg(long)]
        execute: bool,
    },
    /// Print the system-status snapshot.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Some(vault) = cli.vault {
        config.vault.root = vault;
    }
    if let Some(ref mode) = cli.mode {
        match AdapterMode::parse(mode) {
            Ok(mode) => config.adapters.mode = mode,
            Err(bad) => {
                eprintln!("configuration error: unknown mode `{bad}` (expected mock|real)");
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    }
    let config = Arc::new(config);

    let code = match cli.command {
        Command::Init => run_init(&config),
        Command::Start { interval } => run_start(config, interval).await,
        Command::Watch {
            source,
            once,
            run_loop,
            interval,
            dry_run,
        } => run_watch(config, &source, once, run_loop, interval, dry_run).await,
        Command::Execute {
            once,
            run_loop,
            interval,
            dry_run,
            execute,
        } => run_execute(config, once, run_loop, interval, dry_run, execute).await,
        Command::Status => run_status(&config),
    };
    ExitCode::from(code)
}

/// Shared runtime components.
struct App {
    config: Arc<Config>,
    vault: VaultStore,
    registry: PlanRegistry,
    adapters: AdapterRegistry,
    audit: Arc<AuditLogger>,
    executor: Arc<Executor>,
}

async fn build_app(config: Arc<Config>) -> anyhow::Result<App> {
    let vault = VaultStore::open(&config.vault.root).with_context(|| {
        format!(
            "vault not found at {} (run `adjutant init` first)",
            config.vault.root.display()
        )
    })?;

    std::fs::create_dir_all(&config.adapters.state_dir)
        .context("failed to create state directory")?;
    let registry = PlanRegistry::open(&config.registry_db_path())
        .await
        .context("failed to open plan registry")?;

    let secrets = SecretsDir::new(config.adapters.secrets_dir.clone());
    let redactor = PiiRedactor::with_secrets(secrets.known_secrets());
    let audit = Arc::new(AuditLogger::with_redactor(vault.clone(), redactor));

    let adapters = AdapterRegistry::with_defaults(config.adapters.mode, &config.adapters, &secrets);

    let executor = Arc::new(Executor::new(
        vault.clone(),
        registry.clone(),
        adapters.clone(),
        Arc::clone(&audit),
        config.executor.clone(),
    ));

    Ok(App {
        config,
        vault,
        registry,
        adapters,
        audit,
        executor,
    })
}

fn watcher_context(app: &App) -> WatcherContext {
    WatcherContext {
        vault: app.vault.clone(),
        audit: Arc::clone(&app.audit),
        adapters: app.adapters.clone(),
        checkpoints_dir: app.config.checkpoints_dir(),
        ready_dir: app.config.orchestrator.ready_dir.clone(),
    }
}

fn watcher_by_name(name: &str, config: &Config) -> Option<Box<dyn Watcher>> {
    match name {
        "filesystem" => Some(Box::new(FilesystemWatcher)),
        "gmail" => Some(Box::new(GmailWatcher::new(
            config
                .watchers
                .gmail
                .query
                .clone()
                .unwrap_or_else(|| "is:unread".to_owned()),
        ))),
        "whatsapp" => Some(Box::new(WhatsAppWatcher)),
        "linkedin" => Some(Box::new(LinkedInWatcher)),
        "instagram" => Some(Box::new(InstagramWatcher)),
        "odoo" => Some(Box::new(OdooWatcher)),
        _ => None,
    }
}

/// Ctrl-C wired to a watch channel.
fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = tx.send(true);
        }
    });
    rx
}

fn run_init(config: &Config) -> u8 {
    logging::init_cli();
    match VaultStore::init(&config.vault.root) {
        Ok(_) => {}
        Err(e) => {
            error!(error = %e, "vault init failed");
            return EXIT_CONFIG;
        }
    }
    for dir in [
        &config.adapters.state_dir,
        &config.adapters.secrets_dir,
        &config.checkpoints_dir(),
    ] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!(path = %dir.display(), error = %e, "directory creation failed");
            return EXIT_CONFIG;
        }
    }
    println!("vault ready at {}", config.vault.root.display());
    println!(
        "drop adapter credentials into {}",
        config.adapters.secrets_dir.display()
    );
    EXIT_OK
}

async fn run_start(config: Arc<Config>, interval: Option<u64>) -> u8 {
    let mut config = (*config).clone();
    if let Some(secs) = interval {
        config.orchestrator.tick_secs = secs;
    }
    let config = Arc::new(config);

    let _guard = match logging::init_production(&config.tracing_logs_dir()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("logging setup failed: {e:#}");
            return EXIT_CONFIG;
        }
    };

    let app = match build_app(Arc::clone(&config)).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "startup failed");
            return EXIT_CONFIG;
        }
    };

    let orchestrator = Orchestrator::from_parts(
        Arc::clone(&app.config),
        app.vault.clone(),
        app.registry.clone(),
        app.adapters.clone(),
        Arc::clone(&app.executor),
        Arc::clone(&app.audit),
    );

    let shutdown = shutdown_channel();
    orchestrator.run(shutdown).await;
    EXIT_OK
}

async fn run_watch(
    config: Arc<Config>,
    source: &str,
    _once: bool,
    run_loop: bool,
    interval: Option<u64>,
    dry_run: bool,
) -> u8 {
    logging::init_cli();
    let Some(watcher) = watcher_by_name(source, &config) else {
        eprintln!("unknown watcher source: {source}");
        return EXIT_CONFIG;
    };

    let app = match build_app(Arc::clone(&config)).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "startup failed");
            return EXIT_CONFIG;
        }
    };
    let ctx = watcher_context(&app);

    if dry_run {
        // Preview only: poll without writing anything.
        let checkpoint = adjutant::watchers::checkpoint::WatcherCheckpoint::load(
            &ctx.checkpoints_dir,
            watcher.name(),
        )
        .unwrap_or_default();
        return match watcher.poll(&ctx, &checkpoint).await {
            Ok(candidates) => {
                for candidate in &candidates {
                    println!("{}/{}", candidate.dest_folder, candidate.file_name);
                }
                println!("{} intake(s) would be created", candidates.len());
                EXIT_OK
            }
            Err(adjutant::watchers::WatcherError::Auth(detail)) => {
                eprintln!("upstream authentication error: {detail}");
                EXIT_AUTH
            }
            Err(e) => {
                eprintln!("watcher error: {e}");
                EXIT_PARTIAL
            }
        };
    }

    if run_loop {
        let secs = interval.unwrap_or_else(|| watcher_interval(&config, source));
        let shutdown = shutdown_channel();
        if source == "filesystem" {
            watchers::filesystem::run_loop_with_events(
                &ctx,
                Duration::from_secs(secs),
                shutdown,
            )
            .await;
        } else {
            watchers::run_loop(watcher.as_ref(), &ctx, Duration::from_secs(secs), shutdown).await;
        }
        return EXIT_OK;
    }

    match watchers::run_once(watcher.as_ref(), &ctx).await {
        Ok(outcome) if outcome.degraded => EXIT_AUTH,
        Ok(outcome) => {
            println!(
                "{} intake(s) created, {} duplicate(s) skipped",
                outcome.created, outcome.duplicates
            );
            EXIT_OK
        }
        Err(e) => {
            error!(error = %e, "watcher run failed");
            EXIT_PARTIAL
        }
    }
}

fn watcher_interval(config: &Config, source: &str) -> u64 {
    let w = &config.watchers;
    match source {
        "filesystem" => w.filesystem.interval_secs,
        "gmail" => w.gmail.interval_secs,
        "whatsapp" => w.whatsapp.interval_secs,
        "linkedin" => w.linkedin.interval_secs,
        "instagram" => w.instagram.interval_secs,
        "odoo" => w.odoo.interval_secs,
        _ => 300,
    }
}

async fn run_execute(
    config: Arc<Config>,
    _once: bool,
    run_loop: bool,
    interval: Option<u64>,
    dry_run: bool,
    execute: bool,
) -> u8 {
    logging::init_cli();
    let app = match build_app(config).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "startup failed");
            return EXIT_CONFIG;
        }
    };

    let opts = ExecOptions {
        execute_enabled: execute,
        dry_run_only: dry_run,
    };
    let shutdown = shutdown_channel();

    if run_loop {
        let secs = interval.unwrap_or(app.config.orchestrator.tick_secs);
        let mut ticker = tokio::time::interval(Duration::from_secs(secs));
        let mut shutdown_rx = shutdown.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = sweep_once(&app, opts, &shutdown).await {
                        error!(error = %e, "sweep failed");
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        return EXIT_OK;
    }

    match sweep_once(&app, opts, &shutdown).await {
        Ok(tally) => {
            println!(
                "{} executed, {} failed, {} awaiting second approval",
                tally.executed, tally.failed, tally.requeued
            );
            if tally.cancelled {
                EXIT_CANCELLED
            } else if tally.auth_failures > 0 {
                EXIT_AUTH
            } else if tally.failed > 0 {
                EXIT_PARTIAL
            } else {
                EXIT_OK
            }
        }
        Err(e) => {
            error!(error = %e, "sweep failed");
            EXIT_CONFIG
        }
    }
}

#[derive(Debug, Default)]
struct SweepTally {
    executed: usize,
    failed: usize,
    requeued: usize,
    auth_failures: usize,
    cancelled: bool,
}

async fn sweep_once(
    app: &App,
    opts: ExecOptions,
    cancel: &watch::Receiver<bool>,
) -> anyhow::Result<SweepTally> {
    app.registry.reconcile(&app.vault).await?;

    let mut tally = SweepTally::default();
    for plan in app.registry.list_by_status(PlanStatus::Approved).await? {
        match app.executor.execute_plan(&plan.id, opts, cancel).await? {
            ExecOutcome::Executed(_) | ExecOutcome::DryRunOnly(_) => {
                tally.executed = tally.executed.saturating_add(1);
            }
            ExecOutcome::Failed(failed) => {
                tally.failed = tally.failed.saturating_add(1);
                let auth = failed
                    .result
                    .as_ref()
                    .and_then(|r| r["kind"].as_str())
                    .is_some_and(|kind| kind == "auth_error");
                if auth {
                    tally.auth_failures = tally.auth_failures.saturating_add(1);
                }
            }
            ExecOutcome::AwaitingSecondApproval(_) => {
                tally.requeued = tally.requeued.saturating_add(1);
            }
            ExecOutcome::Cancelled => {
                tally.cancelled = true;
                break;
            }
        }
    }
    Ok(tally)
}

fn run_status(config: &Config) -> u8 {
    logging::init_cli();
    let vault = match VaultStore::open(&config.vault.root) {
        Ok(vault) => vault,
        Err(e) => {
            eprintln!("vault not available: {e}");
            return EXIT_CONFIG;
        }
    };
    match vault.read_to_string(STATUS_FILE) {
        Ok(snapshot) => {
            println!("{snapshot}");
            EXIT_OK
        }
        Err(_) => {
            println!("no status snapshot yet; is the orchestrator running?");
            // Remediation intakes are the next best signal.
            if let Ok(pending) = vault.list("Needs_Action/remediation__*.md") {
                for item in pending {
                    println!("open remediation: {}", item.display());
                }
            }
            EXIT_OK
        }
    }
}
