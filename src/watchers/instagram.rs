//! Instagram watcher: wraps new media (and their comment activity) from
//! the Graph listing.

use async_trait::async_trait;
use chrono::Utc;

use crate::intake::{IntakeItem, IntakeType};
use crate::plan::Channel;
use crate::vault::folders;

use super::checkpoint::WatcherCheckpoint;
use super::{file_stamp, IntakeCandidate, Watcher, WatcherContext, WatcherError};

/// Watches an Instagram business account through the Graph listing.
#[derive(Debug, Default)]
pub struct InstagramWatcher;

#[async_trait]
impl Watcher for InstagramWatcher {
    fn name(&self) -> &'static str {
        "instagram"
    }

    async fn poll(
        &self,
        ctx: &WatcherContext,
        checkpoint: &WatcherCheckpoint,
    ) -> Result<Vec<IntakeCandidate>, WatcherError> {
        let adapter = ctx
            .adapters
            .resolve(Channel::Instagram)
            .ok_or_else(|| WatcherError::Upstream("no instagram adapter registered".to_owned()))?;

        let listing = adapter.list(&serde_json::json!({"limit": 25})).await?;
        let media = listing["data"].as_array().cloned().unwrap_or_default();

        let mut candidates = Vec::new();
        for entry in media.iter().rev() {
            let Some(media_id) = entry["id"].as_str() else {
                continue;
            };
            if checkpoint.contains(media_id) {
                continue;
            }
            let caption = entry["caption"].as_str().unwrap_or_default();
            let comments = entry["comments_count"].as_u64().unwrap_or(0);
            let received_at = Utc::now();

            candidates.push(IntakeCandidate {
                file_name: format!(
                    "inbox__instagram__{}__{media_id}.md",
                    file_stamp(received_at)
                ),
                dest_folder: folders::SOCIAL_INBOX,
                item: IntakeItem {
                    id: media_id.to_owned(),
                    source: "instagram".to_owned(),
                    received_at,
                    intake_type: IntakeType::Post,
                    sender: "instagram".to_owned(),
                    subject: format!(
                        "{} media {media_id} ({comments} comments)",
                        entry["media_type"].as_str().unwrap_or("IMAGE")
                    ),
                    excerpt: caption.to_owned(),
                    raw_ref: None,
                    has_attachments: false,
                    urgency: "normal".to_owned(),
                },
            });
        }
        Ok(candidates)
    }
}
