//! Daily briefing and accounting audit: the mechanical half of the daily
//! cycle.
//!
//! The briefing digests the registry and the day's audit partition into a
//! markdown document under `Business/Briefings/`; the accounting audit
//! runs the Odoo read path and files the receivable aging under
//! `Business/Accounting/`. Narrative generation on top of these documents
//! belongs to the content-model collaborator, not the core.

use chrono::Utc;
use tracing::info;

use crate::adapters::AdapterRegistry;
use crate::plan::registry::PlanRegistry;
use crate::plan::{Channel, PlanStatus};
use crate::vault::{folders, VaultStore};

/// Write today's briefing document. Returns its vault-relative path.
///
/// # Errors
///
/// Returns an error on registry or vault failure.
pub async fn write_briefing(
    vault: &VaultStore,
    registry: &PlanRegistry,
) -> anyhow::Result<String> {
    let today = Utc::now().format("%Y-%m-%d");
    let pending = registry.list_by_status(PlanStatus::PendingApproval).await?;
    let approved = registry.count_by_status(PlanStatus::Approved).await?;
    let executed = registry.count_by_status(PlanStatus::Executed).await?;
    let failed = registry.count_by_status(PlanStatus::Failed).await?;

    let mut doc = format!(
        "# Daily Briefing: {today}\n\n\
         ## Plans\n\n\
         - awaiting approval: {}\n\
         - approved, not yet executed: {approved}\n\
         - executed: {executed}\n\
         - failed: {failed}\n\n\
         ## Waiting on you\n\n",
        pending.len(),
    );
    if pending.is_empty() {
        doc.push_str("- nothing pending\n");
    } else {
        for plan in &pending {
            doc.push_str(&format!(
                "- `{}` ({} {}, risk {})\n",
                plan.id,
                plan.channel,
                plan.action_type,
                plan.risk_level.as_str(),
            ));
        }
    }

    // Digest today's audit partition, when one exists.
    doc.push_str("\n## Today's activity\n\n");
    let partition = format!("{}/{today}.json", folders::LOGS);
    match vault.read_to_string(&partition) {
        Ok(log) => {
            let mut ok: u32 = 0;
            let mut errors: u32 = 0;
            let mut dry_runs: u32 = 0;
            for line in log.lines() {
                let Ok(entry) = serde_json::from_str::<serde_json::Value>(line) else {
                    continue;
                };
                match entry["result"].as_str() {
                    Some("ok") => ok = ok.saturating_add(1),
                    Some("error") => errors = errors.saturating_add(1),
                    Some("dry_run") => dry_runs = dry_runs.saturating_add(1),
                    _ => {}
                }
            }
            doc.push_str(&format!(
                "- {ok} completed, {dry_runs} previews, {errors} errors\n"
            ));
        }
        Err(_) => doc.push_str("- no audit entries yet today\n"),
    }

    let rel = format!("{}/briefing__{today}.md", folders::BUSINESS_BRIEFINGS);
    vault.write_atomic(&rel, doc.as_bytes())?;
    info!(path = %rel, "daily briefing written");
    Ok(rel)
}

/// Run the accounting audit through the Odoo adapter read path and file
/// the result. Returns the report path, or `None` when no Odoo adapter is
/// registered.
///
/// # Errors
///
/// Returns an error on vault failure; adapter failures surface in the
/// report body rather than failing the daily cycle.
pub async fn write_accounting_audit(
    vault: &VaultStore,
    adapters: &AdapterRegistry,
) -> anyhow::Result<Option<String>> {
    let Some(adapter) = adapters.resolve(Channel::Odoo) else {
        return Ok(None);
    };
    let today = Utc::now().format("%Y-%m-%d");

    let aging = adapter
        .list(&serde_json::json!({"action": "ar_aging"}))
        .await;
    let body = match aging {
        Ok(buckets) => format!(
            "# Accounting Audit: {today}\n\n\
             ## Receivable aging\n\n```json\n{}\n```\n",
            serde_json::to_string_pretty(&buckets).unwrap_or_else(|_| "{}".to_owned()),
        ),
        Err(e) => format!(
            "# Accounting Audit: {today}\n\n\
             The Odoo read path failed: {e}. Re-run after resolving the \
             connection or credentials.\n",
        ),
    };

    let rel = format!("{}/audit__{today}.md", folders::BUSINESS_ACCOUNTING);
    vault.write_atomic(&rel, body.as_bytes())?;
    info!(path = %rel, "accounting audit written");
    Ok(Some(rel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::MockAdapter;
    use crate::plan::{ActionType, Plan, RiskLevel};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_briefing_lists_pending_plans() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::init(dir.path()).expect("vault");
        let registry = PlanRegistry::open_in_memory().await.expect("registry");

        let mut plan = Plan::new_draft(
            "u1",
            Channel::Gmail,
            ActionType::SendEmail,
            serde_json::json!({"to": "a@b.com"}),
            RiskLevel::Medium,
            "brief",
        );
        plan.status = PlanStatus::PendingApproval;
        registry.insert(&plan).await.expect("insert");

        let rel = write_briefing(&vault, &registry).await.expect("briefing");
        let text = vault.read_to_string(&rel).expect("read");
        assert!(text.contains("awaiting approval: 1"));
        assert!(text.contains(&plan.id));
    }

    #[tokio::test]
    async fn test_accounting_audit_with_mock_adapter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::init(dir.path()).expect("vault");
        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(MockAdapter::succeeding(Channel::Odoo)));

        let rel = write_accounting_audit(&vault, &adapters)
            .await
            .expect("audit")
            .expect("odoo adapter registered");
        assert!(vault.exists(&rel));
    }

    #[tokio::test]
    async fn test_accounting_audit_without_adapter_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = VaultStore::init(dir.path()).expect("vault");
        let result = write_accounting_audit(&vault, &AdapterRegistry::new())
            .await
            .expect("no failure");
        assert!(result.is_none());
    }
}
