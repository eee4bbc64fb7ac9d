//! Odoo watcher: wraps newly unpaid or overdue customer invoices.
//!
//! Identity is `model:record id`, so a paid-then-reopened invoice is
//! perceived as the same object and not re-wrapped.

use async_trait::async_trait;
use chrono::Utc;

use crate::intake::{IntakeItem, IntakeType};
use crate::plan::{slugify, Channel};
use crate::vault::folders;

use super::checkpoint::WatcherCheckpoint;
use super::{file_stamp, IntakeCandidate, Watcher, WatcherContext, WatcherError};

/// Watches unpaid receivables through the odoo adapter's read path.
#[derive(Debug, Default)]
pub struct OdooWatcher;

#[async_trait]
impl Watcher for OdooWatcher {
    fn name(&self) -> &'static str {
        "odoo"
    }

    async fn poll(
        &self,
        ctx: &WatcherContext,
        checkpoint: &WatcherCheckpoint,
    ) -> Result<Vec<IntakeCandidate>, WatcherError> {
        let adapter = ctx
            .adapters
            .resolve(Channel::Odoo)
            .ok_or_else(|| WatcherError::Upstream("no odoo adapter registered".to_owned()))?;

        let listing = adapter
            .list(&serde_json::json!({
                "action": "list_invoices",
                "unpaid_only": true,
                "limit": 100,
            }))
            .await?;
        let rows = listing.as_array().cloned().unwrap_or_default();

        let today = Utc::now().date_naive();
        let mut candidates = Vec::new();
        for row in rows {
            let Some(record_id) = row["id"].as_i64() else {
                continue;
            };
            let id = format!("account.move:{record_id}");
            if checkpoint.contains(&id) {
                continue;
            }

            let name = row["name"].as_str().unwrap_or("invoice").to_owned();
            let partner = row["partner_id"]
                .as_array()
                .and_then(|p| p.get(1))
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown customer")
                .to_owned();
            let residual = row["amount_residual"].as_f64().unwrap_or(0.0);
            let due = row["invoice_date_due"].as_str().unwrap_or("unknown");
            let overdue = row["invoice_date_due"]
                .as_str()
                .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                .is_some_and(|d| d < today);
            let received_at = Utc::now();

            candidates.push(IntakeCandidate {
                file_name: format!(
                    "inbox__odoo__{}__{}.md",
                    file_stamp(received_at),
                    slugify(&name)
                ),
                dest_folder: folders::BUSINESS_ACCOUNTING,
                item: IntakeItem {
                    id,
                    source: "odoo".to_owned(),
                    received_at,
                    intake_type: IntakeType::InvoiceEvent,
                    sender: partner.clone(),
                    subject: if overdue {
                        format!("{name} overdue")
                    } else {
                        format!("{name} unpaid")
                    },
                    excerpt: format!(
                        "Invoice {name} for {partner}: {residual:.2} open, due {due}."
                    ),
                    raw_ref: None,
                    has_attachments: false,
                    urgency: if overdue { "high" } else { "normal" }.to_owned(),
                },
            });
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_model_scoped() {
        let mut cp = WatcherCheckpoint::default();
        cp.record("account.move:42");
        assert!(cp.contains("account.move:42"));
        assert!(!cp.contains("res.partner:42"));
    }
}
