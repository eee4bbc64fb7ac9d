//! WhatsApp watcher: wraps unread chat entries observed by the bridge.
//!
//! Identity is chat id + message `data-id`. The same `data-id` can
//! reappear after DOM churn in the bridge; checkpoint deduplication is
//! authoritative, with the wrapper store's `(source, id)` scan as the
//! crash-window backstop.

use async_trait::async_trait;
use chrono::Utc;

use crate::adapters::whatsapp::UnreadMessage;
use crate::intake::{IntakeItem, IntakeType};
use crate::plan::{slugify, Channel};
use crate::vault::folders;

use super::checkpoint::WatcherCheckpoint;
use super::{file_stamp, IntakeCandidate, Watcher, WatcherContext, WatcherError};

/// Watches unread WhatsApp chats through the bridge adapter.
#[derive(Debug, Default)]
pub struct WhatsAppWatcher;

#[async_trait]
impl Watcher for WhatsAppWatcher {
    fn name(&self) -> &'static str {
        "whatsapp"
    }

    async fn poll(
        &self,
        ctx: &WatcherContext,
        checkpoint: &WatcherCheckpoint,
    ) -> Result<Vec<IntakeCandidate>, WatcherError> {
        let adapter = ctx
            .adapters
            .resolve(Channel::Whatsapp)
            .ok_or_else(|| WatcherError::Upstream("no whatsapp adapter registered".to_owned()))?;

        let listing = adapter.list(&serde_json::json!({})).await?;
        let unread: Vec<UnreadMessage> =
            serde_json::from_value(listing["unread"].clone()).unwrap_or_default();

        let mut candidates = Vec::new();
        for message in unread {
            let id = format!("{}:{}", message.chat_id, message.message_id);
            if checkpoint.contains(&id) {
                continue;
            }
            let received_at = Utc::now();
            candidates.push(IntakeCandidate {
                file_name: format!(
                    "inbox__whatsapp__{}__{}.md",
                    file_stamp(received_at),
                    slugify(&message.sender)
                ),
                dest_folder: folders::SOCIAL_INBOX,
                item: IntakeItem {
                    id,
                    source: "whatsapp".to_owned(),
                    received_at,
                    intake_type: IntakeType::Message,
                    sender: message.sender.clone(),
                    subject: format!("Message from {}", message.sender),
                    excerpt: message.text,
                    raw_ref: None,
                    has_attachments: false,
                    urgency: "normal".to_owned(),
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
    fn test_identity_includes_chat_and_message() {
        let message = UnreadMessage {
            chat_id: "4915@s.whatsapp.net".to_owned(),
            message_id: "3EB0".to_owned(),
            sender: "Dana".to_owned(),
            text: "hi".to_owned(),
            timestamp: None,
        };
        let id = format!("{}:{}", message.chat_id, message.message_id);
        assert_eq!(id, "4915@s.whatsapp.net:3EB0");

        // A checkpoint that has seen the id suppresses re-wrapping even if
        // the bridge reports the same data-id again after DOM churn.
        let mut cp = WatcherCheckpoint::default();
        cp.record(id.clone());
        assert!(cp.contains(&id));
    }
}
