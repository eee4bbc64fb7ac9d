//! Durable plan registry backed by SQLite.
//!
//! The registry mirrors the vault: it is authoritative for payload and
//! history, while the filesystem is authoritative for approval state. On
//! every poll [`PlanRegistry::reconcile`] folds observed file locations
//! back into the rows before anything else acts on them.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, warn};

use crate::vault::{folders, VaultError, VaultStore};

use super::{
    dryrun_file_name, plan_file_name, ActionType, Channel, Plan, PlanFieldError, PlanStatus,
    RiskLevel,
};

/// Registry failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying database error.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    /// A stored field failed enum or timestamp parsing.
    #[error(transparent)]
    Field(#[from] PlanFieldError),
    /// Stored payload or result was not valid JSON.
    #[error("invalid stored JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A stored timestamp failed parsing.
    #[error("invalid stored timestamp: {0}")]
    Timestamp(String),
    /// No plan with this id.
    #[error("plan not found: {0}")]
    NotFound(String),
    /// The requested status edge is not in the state machine.
    #[error("illegal transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// Plan id.
        id: String,
        /// Current status.
        from: PlanStatus,
        /// Requested status.
        to: PlanStatus,
    },
    /// Payload mutation attempted after the plan left `draft`.
    #[error("payload is frozen for {0}")]
    PayloadFrozen(String),
    /// Vault access during reconciliation failed.
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// Optional row updates applied atomically with a status transition.
#[derive(Debug, Default, Clone)]
pub struct TransitionUpdate {
    /// New approval reference, when a human approval was observed.
    pub approval_ref: Option<String>,
    /// New vault-relative file path, when the file moved.
    pub file_path: Option<String>,
    /// New structured result (preview or outcome).
    pub result: Option<serde_json::Value>,
    /// New dry-run approval flag.
    pub dryrun_approved: Option<bool>,
}

/// What reconciliation observed for one plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    /// Human moved the plan file into `Approved/`.
    Approved {
        /// Plan id.
        id: String,
        /// Whether this is the second (dry-run preview) approval.
        second_round: bool,
        /// Recorded approval reference.
        approval_ref: String,
    },
    /// Human moved the plan file into `Rejected/`.
    Rejected {
        /// Plan id.
        id: String,
    },
    /// The file appears in both `Approved/` and `Rejected/` (a copy instead
    /// of a move). Resolved as rejected; execution refused.
    Conflict {
        /// Plan id.
        id: String,
    },
    /// The plan file is in none of the approval folders.
    MissingFile {
        /// Plan id.
        id: String,
    },
}

/// SQLite-backed plan store.
#[derive(Debug, Clone)]
pub struct PlanRegistry {
    pool: SqlitePool,
}

impl PlanRegistry {
    /// Open (creating if missing) a registry database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open(path: &Path) -> Result<Self, RegistryError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let registry = Self { pool };
        registry.migrate().await?;
        Ok(registry)
    }

    /// Open an in-memory registry (tests and `--mode mock` runs).
    ///
    /// A single connection is used so every query sees the same database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub async fn open_in_memory() -> Result<Self, RegistryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let registry = Self { pool };
        registry.migrate().await?;
        Ok(registry)
    }

    async fn migrate(&self) -> Result<(), RegistryError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS plans (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                action_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                risk_level TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                scheduled_at TEXT,
                file_path TEXT,
                result TEXT,
                approval_ref TEXT,
                dryrun_approved INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_plans_status ON plans(status)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert a new plan row.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure (including duplicate id).
    pub async fn insert(&self, plan: &Plan) -> Result<(), RegistryError> {
        sqlx::query(
            "INSERT INTO plans (id, user_id, channel, action_type, payload, status, \
             risk_level, created_at, updated_at, scheduled_at, file_path, result, \
             approval_ref, dryrun_approved) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(&plan.id)
        .bind(&plan.user_id)
        .bind(plan.channel.as_str())
        .bind(plan.action_type.as_str())
        .bind(plan.payload.to_string())
        .bind(plan.status.as_str())
        .bind(plan.risk_level.as_str())
        .bind(plan.created_at.to_rfc3339())
        .bind(plan.updated_at.to_rfc3339())
        .bind(plan.scheduled_at.map(|t| t.to_rfc3339()))
        .bind(plan.file_path.as_deref())
        .bind(plan.result.as_ref().map(ToString::to_string))
        .bind(plan.approval_ref.as_deref())
        .bind(i64::from(plan.dryrun_approved))
        .execute(&self.pool)
        .await?;
        debug!(plan_id = %plan.id, "plan inserted");
        Ok(())
    }

    /// Fetch a plan by id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] when absent.
    pub async fn get(&self, id: &str) -> Result<Plan, RegistryError> {
        let row = sqlx::query("SELECT * FROM plans WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        plan_from_row(&row)
    }

    /// List plans in a given status, FIFO by creation time.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn list_by_status(&self, status: PlanStatus) -> Result<Vec<Plan>, RegistryError> {
        let rows = sqlx::query("SELECT * FROM plans WHERE status = ?1 ORDER BY created_at ASC")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(plan_from_row).collect()
    }

    /// Count plans per status (for the status snapshot).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn count_by_status(&self, status: PlanStatus) -> Result<u64, RegistryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM plans WHERE status = ?1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    /// Perform a status transition atomically, applying `update` in the same
    /// transaction. The current row is re-read inside the transaction so
    /// concurrent transitions serialise per plan.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidTransition`] for edges outside the
    /// state machine.
    pub async fn transition(
        &self,
        id: &str,
        to: PlanStatus,
        update: TransitionUpdate,
    ) -> Result<Plan, RegistryError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM plans WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        let current = plan_from_row(&row)?;

        if !current.status.can_transition(to) {
            return Err(RegistryError::InvalidTransition {
                id: id.to_owned(),
                from: current.status,
                to,
            });
        }

        sqlx::query(
            "UPDATE plans SET status = ?1, updated_at = ?2, \
             approval_ref = COALESCE(?3, approval_ref), \
             file_path = COALESCE(?4, file_path), \
             result = COALESCE(?5, result), \
             dryrun_approved = COALESCE(?6, dryrun_approved) \
             WHERE id = ?7",
        )
        .bind(to.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(update.approval_ref.as_deref())
        .bind(update.file_path.as_deref())
        .bind(update.result.as_ref().map(ToString::to_string))
        .bind(update.dryrun_approved.map(i64::from))
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(plan_id = %id, from = %current.status, to = %to, "plan transitioned");
        self.get(id).await
    }

    /// Replace the payload of a draft plan. Refused once the plan has left
    /// `draft`; from `pending_approval` on the payload is frozen.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::PayloadFrozen`] for non-draft plans.
    pub async fn update_payload(
        &self,
        id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), RegistryError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT status FROM plans WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        let status = PlanStatus::parse(row.try_get::<String, _>("status")?.as_str())?;
        if status != PlanStatus::Draft {
            return Err(RegistryError::PayloadFrozen(id.to_owned()));
        }
        sqlx::query("UPDATE plans SET payload = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(payload.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Record a new file path without a status change (draft edits).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn set_file_path(&self, id: &str, file_path: &str) -> Result<(), RegistryError> {
        let updated = sqlx::query("UPDATE plans SET file_path = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(file_path)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id.to_owned()));
        }
        Ok(())
    }

    /// Fold observed approval-folder state back into the registry.
    ///
    /// The filesystem is authoritative: a row claiming `pending_approval`
    /// whose file sits in `Approved/` is updated before any other component
    /// acts. A file present in both `Approved/` and `Rejected/` resolves as
    /// rejected and is reported as a conflict.
    ///
    /// # Errors
    ///
    /// Returns an error on database or vault failure.
    pub async fn reconcile(
        &self,
        vault: &VaultStore,
    ) -> Result<Vec<ReconcileEvent>, RegistryError> {
        let mut events = Vec::new();
        for plan in self.list_by_status(PlanStatus::PendingApproval).await? {
            let names = [plan_file_name(&plan.id), dryrun_file_name(&plan.id)];
            let found_in = |folder: &str| {
                names
                    .iter()
                    .find(|name| vault.exists(PathBuf::from(folder).join(name.as_str())))
                    .cloned()
            };
            let approved = found_in(folders::APPROVED);
            let rejected = found_in(folders::REJECTED);

            match (approved, rejected) {
                (Some(_), Some(rejected_name)) => {
                    warn!(
                        plan_id = %plan.id,
                        "plan present in both Approved/ and Rejected/; resolving as rejected"
                    );
                    self.transition(
                        &plan.id,
                        PlanStatus::Rejected,
                        TransitionUpdate {
                            file_path: Some(join_rel(folders::REJECTED, &rejected_name)),
                            ..TransitionUpdate::default()
                        },
                    )
                    .await?;
                    events.push(ReconcileEvent::Conflict { id: plan.id });
                }
                (Some(approved_name), None) => {
                    let second_round = approved_name.ends_with(".dryrun.md");
                    let approval_ref = format!(
                        "move:{}:{}",
                        join_rel(folders::APPROVED, &approved_name),
                        Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    );
                    self.transition(
                        &plan.id,
                        PlanStatus::Approved,
                        TransitionUpdate {
                            approval_ref: Some(approval_ref.clone()),
                            file_path: Some(join_rel(folders::APPROVED, &approved_name)),
                            dryrun_approved: second_round.then_some(true),
                            ..TransitionUpdate::default()
                        },
                    )
                    .await?;
                    events.push(ReconcileEvent::Approved {
                        id: plan.id,
                        second_round,
                        approval_ref,
                    });
                }
                (None, Some(rejected_name)) => {
                    self.transition(
                        &plan.id,
                        PlanStatus::Rejected,
                        TransitionUpdate {
                            file_path: Some(join_rel(folders::REJECTED, &rejected_name)),
                            ..TransitionUpdate::default()
                        },
                    )
                    .await?;
                    events.push(ReconcileEvent::Rejected { id: plan.id });
                }
                (None, None) => {
                    let still_pending = names
                        .iter()
                        .any(|n| vault.exists(PathBuf::from(folders::PENDING_APPROVAL).join(n)));
                    if !still_pending {
                        warn!(plan_id = %plan.id, "pending plan file missing from approval folders");
                        events.push(ReconcileEvent::MissingFile { id: plan.id });
                    }
                }
            }
        }
        Ok(events)
    }
}

fn join_rel(folder: &str, name: &str) -> String {
    format!("{folder}/{name}")
}

fn plan_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Plan, RegistryError> {
    let payload: String = row.try_get("payload")?;
    let result: Option<String> = row.try_get("result")?;
    let scheduled_at: Option<String> = row.try_get("scheduled_at")?;
    let dryrun_approved: i64 = row.try_get("dryrun_approved")?;

    Ok(Plan {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        channel: Channel::parse(row.try_get::<String, _>("channel")?.as_str())?,
        action_type: ActionType::parse(row.try_get::<String, _>("action_type")?.as_str())?,
        payload: serde_json::from_str(&payload)?,
        status: PlanStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        risk_level: RiskLevel::parse(row.try_get::<String, _>("risk_level")?.as_str())?,
        created_at: parse_timestamp(row.try_get::<String, _>("created_at")?.as_str())?,
        updated_at: parse_timestamp(row.try_get::<String, _>("updated_at")?.as_str())?,
        scheduled_at: scheduled_at
            .map(|t| parse_timestamp(&t))
            .transpose()?,
        file_path: row.try_get("file_path")?,
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        approval_ref: row.try_get("approval_ref")?,
        dryrun_approved: dryrun_approved != 0,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, RegistryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| RegistryError::Timestamp(s.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ActionType, Channel, RiskLevel};

    fn sample_plan() -> Plan {
        Plan::new_draft(
            "u1",
            Channel::Gmail,
            ActionType::SendEmail,
            serde_json::json!({"to": "a@b.com"}),
            RiskLevel::Low,
            "test",
        )
    }

    #[tokio::test]
    async fn test_insert_and_get_round_trip() {
        let registry = PlanRegistry::open_in_memory().await.expect("open");
        let plan = sample_plan();
        registry.insert(&plan).await.expect("insert");

        let loaded = registry.get(&plan.id).await.expect("get");
        assert_eq!(loaded.id, plan.id);
        assert_eq!(loaded.channel, Channel::Gmail);
        assert_eq!(loaded.action_type, ActionType::SendEmail);
        assert_eq!(loaded.status, PlanStatus::Draft);
        assert_eq!(loaded.payload["to"], "a@b.com");
        assert!(!loaded.dryrun_approved);
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let registry = PlanRegistry::open_in_memory().await.expect("open");
        assert!(matches!(
            registry.get("ghost").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transition_enforces_state_machine() {
        let registry = PlanRegistry::open_in_memory().await.expect("open");
        let plan = sample_plan();
        registry.insert(&plan).await.expect("insert");

        // Draft cannot jump straight to approved.
        let result = registry
            .transition(&plan.id, PlanStatus::Approved, TransitionUpdate::default())
            .await;
        assert!(matches!(
            result,
            Err(RegistryError::InvalidTransition { .. })
        ));

        // The legal path works.
        let p = registry
            .transition(
                &plan.id,
                PlanStatus::PendingApproval,
                TransitionUpdate::default(),
            )
            .await
            .expect("to pending");
        assert_eq!(p.status, PlanStatus::PendingApproval);
    }

    #[tokio::test]
    async fn test_payload_frozen_after_draft() {
        let registry = PlanRegistry::open_in_memory().await.expect("open");
        let plan = sample_plan();
        registry.insert(&plan).await.expect("insert");

        registry
            .update_payload(&plan.id, &serde_json::json!({"to": "c@d.com"}))
            .await
            .expect("draft payload editable");

        registry
            .transition(
                &plan.id,
                PlanStatus::PendingApproval,
                TransitionUpdate::default(),
            )
            .await
            .expect("to pending");

        let result = registry
            .update_payload(&plan.id, &serde_json::json!({"to": "e@f.com"}))
            .await;
        assert!(matches!(result, Err(RegistryError::PayloadFrozen(_))));
    }

    #[tokio::test]
    async fn test_reconcile_observes_approval_move() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::init(dir.path()).expect("vault");
        let registry = PlanRegistry::open_in_memory().await.expect("open");

        let plan = sample_plan();
        registry.insert(&plan).await.expect("insert");
        registry
            .transition(
                &plan.id,
                PlanStatus::PendingApproval,
                TransitionUpdate::default(),
            )
            .await
            .expect("to pending");

        // Human moves the file into Approved/.
        vault
            .write_atomic(format!("Approved/{}", plan.file_name()), b"doc")
            .expect("write");

        let events = registry.reconcile(&vault).await.expect("reconcile");
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            ReconcileEvent::Approved {
                second_round: false,
                ..
            }
        ));

        let loaded = registry.get(&plan.id).await.expect("get");
        assert_eq!(loaded.status, PlanStatus::Approved);
        assert!(loaded.approval_ref.is_some());
        assert_eq!(
            loaded.file_path.as_deref(),
            Some(format!("Approved/{}", plan.file_name()).as_str())
        );
    }

    #[tokio::test]
    async fn test_reconcile_conflict_resolves_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::init(dir.path()).expect("vault");
        let registry = PlanRegistry::open_in_memory().await.expect("open");

        let plan = sample_plan();
        registry.insert(&plan).await.expect("insert");
        registry
            .transition(
                &plan.id,
                PlanStatus::PendingApproval,
                TransitionUpdate::default(),
            )
            .await
            .expect("to pending");

        // Human copied instead of moving: file in both folders.
        vault
            .write_atomic(format!("Approved/{}", plan.file_name()), b"doc")
            .expect("write");
        vault
            .write_atomic(format!("Rejected/{}", plan.file_name()), b"doc")
            .expect("write");

        let events = registry.reconcile(&vault).await.expect("reconcile");
        assert!(matches!(events[0], ReconcileEvent::Conflict { .. }));
        let loaded = registry.get(&plan.id).await.expect("get");
        assert_eq!(loaded.status, PlanStatus::Rejected, "conflict means rejected");
    }

    #[tokio::test]
    async fn test_reconcile_second_round_dryrun() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::init(dir.path()).expect("vault");
        let registry = PlanRegistry::open_in_memory().await.expect("open");

        let mut plan = sample_plan();
        plan.status = PlanStatus::PendingApproval;
        registry.insert(&plan).await.expect("insert");

        vault
            .write_atomic(format!("Approved/{}", dryrun_file_name(&plan.id)), b"doc")
            .expect("write");

        let events = registry.reconcile(&vault).await.expect("reconcile");
        assert!(matches!(
            events[0],
            ReconcileEvent::Approved {
                second_round: true,
                ..
            }
        ));
        let loaded = registry.get(&plan.id).await.expect("get");
        assert!(loaded.dryrun_approved);
    }

    #[tokio::test]
    async fn test_reconcile_idempotent_when_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::init(dir.path()).expect("vault");
        let registry = PlanRegistry::open_in_memory().await.expect("open");

        let mut plan = sample_plan();
        plan.status = PlanStatus::PendingApproval;
        plan.file_path = Some(format!("Pending_Approval/{}", plan.file_name()));
        registry.insert(&plan).await.expect("insert");
        vault
            .write_atomic(format!("Pending_Approval/{}", plan.file_name()), b"doc")
            .expect("write");

        let first = registry.reconcile(&vault).await.expect("reconcile");
        let second = registry.reconcile(&vault).await.expect("reconcile");
        assert!(first.is_empty());
        assert!(second.is_empty());
    }
}
