//! Configuration loading and runtime paths.
//!
//! Loaded from `adjutant.toml` (or `$ADJUTANT_CONFIG_PATH`). Environment
//! variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::AdapterMode;

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Vault location.
    pub vault: VaultConfig,
    /// Per-watcher settings.
    pub watchers: WatchersConfig,
    /// Adapter settings.
    pub adapters: AdaptersConfig,
    /// Executor policy.
    pub executor: ExecutorConfig,
    /// Orchestrator cadence and daily cycle.
    pub orchestrator: OrchestratorConfig,
    /// Audit retention.
    pub audit: AuditConfig,
}

impl Config {
    /// Load configuration with precedence env vars > TOML file > defaults.
    ///
    /// Config file path: `$ADJUTANT_CONFIG_PATH` or `./adjutant.toml`. A
    /// missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error for an unreadable or unparsable config file.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = std::env::var("ADJUTANT_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("adjutant.toml"));
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: Config =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no config file found, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Parse a TOML string into config (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error for invalid TOML.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function for testability.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("ADJUTANT_VAULT") {
            self.vault.root = PathBuf::from(v);
        }
        if let Some(v) = env("ADJUTANT_MODE") {
            match AdapterMode::parse(&v) {
                Ok(mode) => self.adapters.mode = mode,
                Err(bad) => tracing::warn!(
                    var = "ADJUTANT_MODE",
                    value = %bad,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("ADJUTANT_SECRETS_DIR") {
            self.adapters.secrets_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ADJUTANT_STATE_DIR") {
            self.adapters.state_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ADJUTANT_READY_DIR") {
            self.orchestrator.ready_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ADJUTANT_DAILY_CYCLE_CRON") {
            self.orchestrator.daily_cycle_cron = v;
        }
        if let Some(v) = env("ADJUTANT_RETENTION_DAYS") {
            match v.parse() {
                Ok(n) => self.audit.retention_days = n,
                Err(_) => tracing::warn!(
                    var = "ADJUTANT_RETENTION_DAYS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("ADJUTANT_WHATSAPP_BRIDGE_URL") {
            self.adapters.whatsapp_bridge_url = v;
        }
        if let Some(v) = env("ADJUTANT_LINKEDIN_VERSION") {
            self.adapters.linkedin_version = v;
        }
    }

    /// Path of the plan registry database.
    pub fn registry_db_path(&self) -> PathBuf {
        self.adapters.state_dir.join("plans.db")
    }

    /// Directory for watcher checkpoints.
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.adapters.state_dir.join("checkpoints")
    }

    /// Directory for operational (tracing) logs, distinct from the audit
    /// log inside the vault.
    pub fn tracing_logs_dir(&self) -> PathBuf {
        self.adapters.state_dir.join("logs")
    }
}

// ── Vault ───────────────────────────────────────────────────────

/// Vault location settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault root directory.
    pub root: PathBuf,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: default_base_dir().join("vault"),
        }
    }
}

// ── Watchers ────────────────────────────────────────────────────

/// Settings for one watcher.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Whether the orchestrator runs this watcher.
    pub enabled: bool,
    /// Seconds between runs in loop mode and under the orchestrator.
    pub interval_secs: u64,
    /// Source-specific query (e.g. the Gmail search expression).
    pub query: Option<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            query: None,
        }
    }
}

/// Per-source watcher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchersConfig {
    /// Filesystem drop watcher.
    pub filesystem: WatcherConfig,
    /// Gmail watcher.
    pub gmail: WatcherConfig,
    /// WhatsApp watcher.
    pub whatsapp: WatcherConfig,
    /// LinkedIn watcher.
    pub linkedin: WatcherConfig,
    /// Instagram watcher.
    pub instagram: WatcherConfig,
    /// Odoo invoice watcher.
    pub odoo: WatcherConfig,
}

impl Default for WatchersConfig {
    fn default() -> Self {
        Self {
            filesystem: WatcherConfig {
                interval_secs: 120,
                ..WatcherConfig::default()
            },
            gmail: WatcherConfig {
                query: Some("is:unread".to_owned()),
                ..WatcherConfig::default()
            },
            whatsapp: WatcherConfig::default(),
            linkedin: WatcherConfig {
                interval_secs: 900,
                ..WatcherConfig::default()
            },
            instagram: WatcherConfig {
                interval_secs: 900,
                ..WatcherConfig::default()
            },
            odoo: WatcherConfig {
                interval_secs: 1800,
                ..WatcherConfig::default()
            },
        }
    }
}

// ── Adapters ────────────────────────────────────────────────────

/// Adapter settings shared across channels.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdaptersConfig {
    /// Mock or real mode.
    pub mode: AdapterMode,
    /// Secrets directory holding per-adapter credential blobs.
    pub secrets_dir: PathBuf,
    /// State directory (registry db, checkpoints, identity caches).
    pub state_dir: PathBuf,
    /// WhatsApp bridge base URL.
    pub whatsapp_bridge_url: String,
    /// LinkedIn version header (`YYYYMM`, or `YYYYMMDD` which the adapter
    /// truncates).
    pub linkedin_version: String,
}

impl Default for AdaptersConfig {
    fn default() -> Self {
        Self {
            mode: AdapterMode::Mock,
            secrets_dir: default_base_dir().join("secrets"),
            state_dir: default_base_dir().join("state"),
            whatsapp_bridge_url: crate::adapters::whatsapp::DEFAULT_BRIDGE_URL.to_owned(),
            linkedin_version: "202502".to_owned(),
        }
    }
}

// ── Executor ────────────────────────────────────────────────────

/// Executor retry and approval policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Default per-action timeout in seconds.
    pub timeout_secs: u64,
    /// Per-action timeout overrides keyed by action name.
    pub action_timeout_secs: HashMap<String, u64>,
    /// Exponential backoff base in seconds.
    pub retry_base_secs: u64,
    /// Maximum attempts for transient failures (ignored for no-retry
    /// actions).
    pub retry_max_attempts: u32,
    /// Soft bound on queued plans per `(channel, user)` lane.
    pub queue_soft_bound: usize,
    /// Mutating action names exempt from the second (dry-run) approval.
    /// Empty by default: every mutating action is sensitive.
    pub auto_approve: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            action_timeout_secs: HashMap::new(),
            retry_base_secs: 2,
            retry_max_attempts: 3,
            queue_soft_bound: 32,
            auto_approve: Vec::new(),
        }
    }
}

// ── Orchestrator ────────────────────────────────────────────────

/// Bounded autonomy loop settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutonomyConfig {
    /// Whether the daily cycle runs the autonomy loop.
    pub enabled: bool,
    /// Iteration bound (hard-capped at 50 regardless of config).
    pub max_iterations: u32,
    /// Plans a single iteration may create.
    pub max_plans_per_iteration: u32,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: 10,
            max_plans_per_iteration: 5,
        }
    }
}

/// Orchestrator cadence settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Seconds between orchestrator ticks (approval scan + sweeps).
    pub tick_secs: u64,
    /// Cron expression (seconds-resolution) for the daily cycle.
    pub daily_cycle_cron: String,
    /// Directory for readiness sentinel files.
    pub ready_dir: PathBuf,
    /// Opaque user id recorded on orchestrator-driven work.
    pub user_id: String,
    /// Autonomy loop settings.
    pub autonomy: AutonomyConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            daily_cycle_cron: "0 0 7 * * *".to_owned(),
            ready_dir: PathBuf::from("/tmp"),
            user_id: "owner".to_owned(),
            autonomy: AutonomyConfig::default(),
        }
    }
}

// ── Audit ───────────────────────────────────────────────────────

/// Audit retention settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Days before a log partition is moved to the compressed archive.
    pub retention_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { retention_days: 90 }
    }
}

/// Base directory for all adjutant state: `~/.adjutant` (or the working
/// directory when no home is resolvable).
pub fn default_base_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".adjutant"))
        .unwrap_or_else(|| PathBuf::from(".adjutant"))
}
