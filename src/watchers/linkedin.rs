//! LinkedIn watcher: wraps new posts from the adapter-provided listing.
//!
//! Identity is the post URN, which is stable across listings.

use async_trait::async_trait;
use chrono::Utc;

use crate::intake::{IntakeItem, IntakeType};
use crate::plan::{slugify, Channel};
use crate::vault::folders;

use super::checkpoint::WatcherCheckpoint;
use super::{file_stamp, IntakeCandidate, Watcher, WatcherContext, WatcherError};

/// Characters of commentary surfaced as the wrapper subject.
const SUBJECT_CAP: usize = 60;

/// Watches the member's LinkedIn activity through the adapter listing.
#[derive(Debug, Default)]
pub struct LinkedInWatcher;

#[async_trait]
impl Watcher for LinkedInWatcher {
    fn name(&self) -> &'static str {
        "linkedin"
    }

    async fn poll(
        &self,
        ctx: &WatcherContext,
        checkpoint: &WatcherCheckpoint,
    ) -> Result<Vec<IntakeCandidate>, WatcherError> {
        let adapter = ctx
            .adapters
            .resolve(Channel::Linkedin)
            .ok_or_else(|| WatcherError::Upstream("no linkedin adapter registered".to_owned()))?;

        let listing = adapter.list(&serde_json::json!({"limit": 10})).await?;
        let elements = listing["elements"].as_array().cloned().unwrap_or_default();

        let mut candidates = Vec::new();
        for element in elements.iter().rev() {
            let Some(urn) = element["id"].as_str() else {
                continue;
            };
            if checkpoint.contains(urn) {
                continue;
            }
            let commentary = element["commentary"].as_str().unwrap_or_default();
            let subject: String = commentary.chars().take(SUBJECT_CAP).collect();
            let received_at = Utc::now();

            candidates.push(IntakeCandidate {
                file_name: format!(
                    "inbox__linkedin__{}__{}.md",
                    file_stamp(received_at),
                    slugify(urn)
                ),
                dest_folder: folders::SOCIAL_INBOX,
                item: IntakeItem {
                    id: urn.to_owned(),
                    source: "linkedin".to_owned(),
                    received_at,
                    intake_type: IntakeType::Post,
                    sender: element["author"].as_str().unwrap_or("linkedin").to_owned(),
                    subject,
                    excerpt: commentary.to_owned(),
                    raw_ref: None,
                    has_attachments: false,
                    urgency: "normal".to_owned(),
                },
            });
        }
        Ok(candidates)
    }
}
