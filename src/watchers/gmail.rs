//! Gmail watcher: wraps unread messages matching the configured query.

use async_trait::async_trait;
use chrono::Utc;

use crate::intake::{IntakeItem, IntakeType};
use crate::plan::{slugify, Channel};
use crate::vault::folders;

use super::checkpoint::WatcherCheckpoint;
use super::{file_stamp, IntakeCandidate, Watcher, WatcherContext, WatcherError};

/// Messages fetched per run.
const PAGE_SIZE: u64 = 25;

/// Watches a Gmail mailbox through the gmail adapter's read path.
#[derive(Debug)]
pub struct GmailWatcher {
    query: String,
}

impl GmailWatcher {
    /// Create a watcher with the configured search query.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
        }
    }
}

impl Default for GmailWatcher {
    fn default() -> Self {
        Self::new("is:unread")
    }
}

#[async_trait]
impl Watcher for GmailWatcher {
    fn name(&self) -> &'static str {
        "gmail"
    }

    async fn poll(
        &self,
        ctx: &WatcherContext,
        checkpoint: &WatcherCheckpoint,
    ) -> Result<Vec<IntakeCandidate>, WatcherError> {
        let adapter = ctx
            .adapters
            .resolve(Channel::Gmail)
            .ok_or_else(|| WatcherError::Upstream("no gmail adapter registered".to_owned()))?;

        let listing = adapter
            .list(&serde_json::json!({
                "q": self.query,
                "max_results": PAGE_SIZE,
            }))
            .await?;

        let ids: Vec<String> = listing["messages"]
            .as_array()
            .map(|messages| {
                messages
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(ToOwned::to_owned))
                    .collect()
            })
            .unwrap_or_default();

        let mut candidates = Vec::new();
        // The API lists newest first; reverse for chronological intake
        // creation.
        for id in ids.iter().rev() {
            if checkpoint.contains(id) {
                continue;
            }
            let message = adapter.read(id).await?;
            let from = message["from"].as_str().unwrap_or("unknown").to_owned();
            let subject = message["subject"].as_str().unwrap_or("(no subject)").to_owned();
            let received_at = Utc::now();

            candidates.push(IntakeCandidate {
                file_name: format!(
                    "gmail__{}__{}__{}.md",
                    slugify(&from),
                    slugify(&subject),
                    file_stamp(received_at)
                ),
                dest_folder: folders::NEEDS_ACTION,
                item: IntakeItem {
                    id: id.clone(),
                    source: "gmail".to_owned(),
                    received_at,
                    intake_type: IntakeType::Email,
                    sender: from,
                    subject,
                    excerpt: message["snippet"].as_str().unwrap_or_default().to_owned(),
                    raw_ref: None,
                    has_attachments: message["has_attachments"].as_bool().unwrap_or(false),
                    urgency: "normal".to_owned(),
                },
            });
        }
        Ok(candidates)
    }
}
