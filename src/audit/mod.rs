//! Append-only audit log: the single source of truth for what was done
//! and why.
//!
//! Every side-effecting external call, plan transition, watcher run, and
//! approval decision produces exactly one entry. Entries are written as one
//! JSON object per line to `Logs/<UTC-date>.json` and summarised into the
//! human-readable `system_log.md`. The line is durable (flushed) before
//! [`AuditLogger::log`] returns, so callers may treat a logged operation as
//! recorded. Redaction happens inside the logger; callers cannot opt out.

pub mod redactor;

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::vault::{folders, VaultError, VaultStore};
use redactor::PiiRedactor;

/// Outcome class recorded on an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    /// The operation completed successfully.
    Ok,
    /// The operation failed.
    Error,
    /// A dry-run preview was produced; nothing was mutated.
    DryRun,
    /// The component is degraded (auth failure, backpressure) but alive.
    Degraded,
}

/// Who performed the audited action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// The reasoning step acting on behalf of the user.
    Ai,
    /// A human, identified by opaque user id.
    Human(String),
    /// A perception watcher, by watcher name.
    Watcher(String),
    /// The scheduled orchestrator.
    Orchestrator,
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ai => f.write_str("ai"),
            Self::Human(id) => write!(f, "human:{id}"),
            Self::Watcher(name) => write!(f, "watcher:{name}"),
            Self::Orchestrator => f.write_str("orchestrator"),
        }
    }
}

impl std::str::FromStr for Actor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "ai" {
            Ok(Self::Ai)
        } else if s == "orchestrator" {
            Ok(Self::Orchestrator)
        } else if let Some(id) = s.strip_prefix("human:") {
            Ok(Self::Human(id.to_owned()))
        } else if let Some(name) = s.strip_prefix("watcher:") {
            Ok(Self::Watcher(name.to_owned()))
        } else {
            Err(format!("unknown actor: {s}"))
        }
    }
}

impl Serialize for Actor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Actor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the action happened (UTC).
    pub timestamp: DateTime<Utc>,
    /// What kind of action, e.g. `send_email`, `watcher_run`, `reject`.
    pub action_type: String,
    /// Who performed it.
    pub actor: Actor,
    /// Channel + object URN the action targeted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Action parameters, redacted by the logger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    /// Approval state of the plan at the time of the action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_status: Option<String>,
    /// Reference to the approval event, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_ref: Option<String>,
    /// Who approved, when approval applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    /// Outcome class.
    pub result: AuditResult,
    /// Error detail for failed operations, redacted by the logger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of the operation, when measured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl AuditEntry {
    /// Start an entry stamped now.
    pub fn new(action_type: impl Into<String>, actor: Actor, result: AuditResult) -> Self {
        Self {
            timestamp: Utc::now(),
            action_type: action_type.into(),
            actor,
            target: None,
            parameters: None,
            approval_status: None,
            approval_ref: None,
            approved_by: None,
            result,
            error: None,
            duration_ms: None,
        }
    }

    /// Set the target URN (`channel:object`).
    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Attach action parameters.
    #[must_use]
    pub fn parameters(mut self, params: serde_json::Value) -> Self {
        self.parameters = Some(params);
        self
    }

    /// Record the approval context.
    #[must_use]
    pub fn approval(
        mut self,
        status: impl Into<String>,
        approval_ref: Option<String>,
        approved_by: Option<String>,
    ) -> Self {
        self.approval_status = Some(status.into());
        self.approval_ref = approval_ref;
        self.approved_by = approved_by;
        self
    }

    /// Record an error detail.
    #[must_use]
    pub fn error_detail(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Record the wall-clock duration.
    #[must_use]
    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }
}

/// Audit logger failures.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The underlying vault write failed; the originating operation must
    /// not report success.
    #[error(transparent)]
    Vault(#[from] VaultError),
    /// The entry could not be serialised.
    #[error("failed to serialise audit entry: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The internal write lock was poisoned.
    #[error("audit write lock poisoned")]
    Poisoned,
}

/// Writes audit entries to the vault with mandatory redaction.
#[derive(Debug)]
pub struct AuditLogger {
    vault: VaultStore,
    redactor: PiiRedactor,
    // Serialises writers so entries are globally ordered by arrival.
    write_lock: Mutex<()>,
}

impl AuditLogger {
    /// Create a logger with the default PII redactor.
    pub fn new(vault: VaultStore) -> Self {
        Self::with_redactor(vault, PiiRedactor::new())
    }

    /// Create a logger with a redactor seeded with known secret values.
    pub fn with_redactor(vault: VaultStore, redactor: PiiRedactor) -> Self {
        Self {
            vault,
            redactor,
            write_lock: Mutex::new(()),
        }
    }

    /// Write one entry to the daily NDJSON partition and the markdown
    /// mirror. The entry is durable when this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns an error if either write fails; callers must treat that as
    /// failure of the operation being audited.
    pub fn log(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let sanitized = self.sanitize(entry);
        let line = serde_json::to_string(&sanitized)?;

        let partition = PathBuf::from(folders::LOGS)
            .join(format!("{}.json", sanitized.timestamp.format("%Y-%m-%d")));
        let mirror = self.mirror_line(&sanitized);

        let _guard = self.write_lock.lock().map_err(|_| AuditError::Poisoned)?;
        self.vault.append(&partition, format!("{line}\n").as_bytes())?;
        self.vault.append("system_log.md", mirror.as_bytes())?;
        Ok(())
    }

    /// Move partitions older than `retention_days` into gzip archives under
    /// `Logs/archive/`. Entries are never deleted. Returns the number of
    /// partitions archived.
    ///
    /// # Errors
    ///
    /// Returns an error on vault I/O failure.
    pub fn archive_older_than(&self, retention_days: u32) -> Result<usize, AuditError> {
        use std::io::Write as _;

        let cutoff = Utc::now()
            .date_naive()
            .checked_sub_days(chrono::Days::new(u64::from(retention_days)))
            .unwrap_or(chrono::NaiveDate::MIN);

        let mut archived: usize = 0;
        for rel in self.vault.list(&format!("{}/*.json", folders::LOGS))? {
            let Some(stem) = rel.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(date) = chrono::NaiveDate::parse_from_str(stem, "%Y-%m-%d") else {
                continue;
            };
            if date >= cutoff {
                continue;
            }

            let contents = self.vault.read(&rel)?;
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            let compressed = encoder
                .write_all(&contents)
                .and_then(|()| encoder.finish())
                .map_err(|e| VaultError::Io {
                    path: rel.clone(),
                    source: e,
                })?;

            let dest = PathBuf::from(folders::LOGS_ARCHIVE).join(format!("{stem}.json.gz"));
            self.vault.write_atomic(&dest, &compressed)?;
            self.vault.delete(&rel)?;
            archived = archived.saturating_add(1);
            info!(partition = %rel.display(), "audit partition archived");
        }
        Ok(archived)
    }

    /// Apply mandatory redaction to the sensitive fields.
    fn sanitize(&self, mut entry: AuditEntry) -> AuditEntry {
        if let Some(params) = entry.parameters.take() {
            entry.parameters = Some(self.redactor.redact_value(&params));
        }
        if let Some(target) = entry.target.take() {
            entry.target = Some(self.redactor.redact(&target));
        }
        if let Some(error) = entry.error.take() {
            entry.error = Some(self.redactor.redact(&error));
        }
        entry
    }

    fn mirror_line(&self, entry: &AuditEntry) -> String {
        let result = match entry.result {
            AuditResult::Ok => "ok",
            AuditResult::Error => "error",
            AuditResult::DryRun => "dry_run",
            AuditResult::Degraded => "degraded",
        };
        let mut line = format!(
            "- {} `{}` by {}: {result}",
            entry.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            entry.action_type,
            entry.actor,
        );
        if let Some(ref target) = entry.target {
            line.push_str(&format!(" → {target}"));
        }
        if let Some(ms) = entry.duration_ms {
            line.push_str(&format!(" ({ms} ms)"));
        }
        if let Some(ref error) = entry.error {
            line.push_str(&format!(" ({error})"));
        }
        line.push('\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_logger() -> (tempfile::TempDir, VaultStore, AuditLogger) {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::init(dir.path()).expect("init");
        let logger = AuditLogger::new(vault.clone());
        (dir, vault, logger)
    }

    #[test]
    fn test_log_writes_daily_partition_and_mirror() {
        let (_dir, vault, logger) = temp_logger();
        let entry = AuditEntry::new("send_email", Actor::Ai, AuditResult::Ok)
            .target("gmail:msg-18e")
            .duration_ms(812);
        logger.log(entry).expect("log");

        let partition = format!("Logs/{}.json", Utc::now().format("%Y-%m-%d"));
        let text = vault.read_to_string(&partition).expect("partition exists");
        let parsed: serde_json::Value =
            serde_json::from_str(text.trim()).expect("line is valid JSON");
        assert_eq!(parsed["action_type"], "send_email");
        assert_eq!(parsed["result"], "ok");
        assert_eq!(parsed["duration_ms"], 812);

        let mirror = vault.read_to_string("system_log.md").expect("mirror");
        assert!(mirror.contains("`send_email` by ai"));
        assert!(mirror.contains("(812 ms)"));
    }

    #[test]
    fn test_redaction_cannot_be_opted_out() {
        let (_dir, vault, logger) = temp_logger();
        let entry = AuditEntry::new("send_email", Actor::Ai, AuditResult::Ok)
            .target("gmail:client@example.com")
            .parameters(serde_json::json!({"to": "client@example.com", "body": "hi"}))
            .error_detail("rejected by client@example.com");
        logger.log(entry).expect("log");

        let partition = format!("Logs/{}.json", Utc::now().format("%Y-%m-%d"));
        let text = vault.read_to_string(&partition).expect("read");
        assert!(!text.contains("client@example.com"), "got: {text}");
        assert!(text.contains(redactor::REDACTED_EMAIL));
    }

    #[test]
    fn test_actor_round_trip() {
        for actor in [
            Actor::Ai,
            Actor::Human("u1".to_owned()),
            Actor::Watcher("gmail".to_owned()),
            Actor::Orchestrator,
        ] {
            let s = actor.to_string();
            let parsed: Actor = s.parse().expect("parse");
            assert_eq!(parsed, actor);
        }
    }

    #[test]
    fn test_entries_accumulate_as_ndjson() {
        let (_dir, vault, logger) = temp_logger();
        for i in 0..3u8 {
            logger
                .log(AuditEntry::new(
                    format!("op_{i}"),
                    Actor::Orchestrator,
                    AuditResult::Ok,
                ))
                .expect("log");
        }
        let partition = format!("Logs/{}.json", Utc::now().format("%Y-%m-%d"));
        let text = vault.read_to_string(&partition).expect("read");
        let lines: Vec<&str> = text.trim().lines().collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            serde_json::from_str::<serde_json::Value>(line).expect("valid JSON per line");
        }
    }

    #[test]
    fn test_archive_moves_old_partitions() {
        let (_dir, vault, logger) = temp_logger();
        vault
            .append("Logs/2020-01-01.json", b"{\"old\":true}\n")
            .expect("seed old partition");
        let today = format!("Logs/{}.json", Utc::now().format("%Y-%m-%d"));
        vault
            .append(&today, b"{\"fresh\":true}\n")
            .expect("seed fresh partition");

        let archived = logger.archive_older_than(90).expect("archive");
        assert_eq!(archived, 1);
        assert!(!vault.exists("Logs/2020-01-01.json"));
        assert!(vault.exists("Logs/archive/2020-01-01.json.gz"));
        assert!(vault.exists(&today), "fresh partition stays");
    }
}
