//! WhatsApp adapter: HTTP client for the WhatsApp Web bridge sidecar.
//!
//! Browser automation lives in the sidecar (an external collaborator);
//! this adapter only speaks its local HTTP API. Send paths go through
//! `dry_run`/`execute` like every channel; the unread listing feeds the
//! whatsapp watcher.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::plan::{ActionType, Channel};

use super::{
    require_in_catalog, AdapterError, Capabilities, ChannelAdapter, ExecutionResult, Preview,
};

/// Default local bridge endpoint.
pub const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:3001";

/// HTTP connect timeout for the bridge.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Response envelope used by every bridge endpoint.
#[derive(Debug, Deserialize)]
struct BridgeResponse<T> {
    #[allow(dead_code)]
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Bridge connection status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Whether the bridge holds a linked WhatsApp Web session.
    pub connected: bool,
    /// Linked phone number, when connected.
    pub phone_number: Option<String>,
}

/// One unread chat entry as reported by the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadMessage {
    /// Chat JID.
    pub chat_id: String,
    /// Bridge-assigned message identity (`data-id` in the DOM).
    pub message_id: String,
    /// Sender display name.
    pub sender: String,
    /// Message text.
    pub text: String,
    /// ISO 8601 timestamp, if the bridge captured one.
    pub timestamp: Option<String>,
}

/// Payload for `send_message`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagePayload {
    /// Recipient chat JID (e.g. `4915…@s.whatsapp.net`).
    pub recipient: String,
    /// Message text.
    pub text: String,
}

impl MessagePayload {
    /// Parse and validate the payload completely.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Validation`] for shape or field problems.
    pub fn parse(payload: &serde_json::Value) -> Result<Self, AdapterError> {
        let parsed: Self = serde_json::from_value(payload.clone())
            .map_err(|e| AdapterError::Validation(format!("message payload: {e}")))?;
        if !parsed.recipient.contains('@') {
            return Err(AdapterError::Validation(format!(
                "recipient is not a JID: {}",
                parsed.recipient
            )));
        }
        if parsed.text.trim().is_empty() {
            return Err(AdapterError::Validation("message text is empty".to_owned()));
        }
        Ok(parsed)
    }
}

/// WhatsApp channel adapter.
#[derive(Debug)]
pub struct WhatsAppAdapter {
    http: reqwest::Client,
    base_url: String,
}

impl WhatsAppAdapter {
    /// Create an adapter against the given bridge base URL.
    pub fn new(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { http, base_url }
    }

    /// The bridge base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_data<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, AdapterError> {
        let response = self
            .http
            .get(format!("{}/{path}", self.base_url))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), detail));
        }
        let body: BridgeResponse<T> = response.json().await?;
        body.data.ok_or_else(|| {
            AdapterError::Auth(
                body.error
                    .unwrap_or_else(|| "bridge has no linked session".to_owned()),
            )
        })
    }

    /// Current bridge status (session linkage).
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Transient`] when the sidecar is unreachable.
    pub async fn status(&self) -> Result<BridgeStatus, AdapterError> {
        self.get_data("status").await
    }

    /// Unread chat entries observed by the bridge, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the sidecar is unreachable or unlinked.
    pub async fn unread(&self) -> Result<Vec<UnreadMessage>, AdapterError> {
        self.get_data("unread").await
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WhatsAppAdapter {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    async fn capabilities(&self) -> Capabilities {
        match self.status().await {
            Ok(status) if status.connected => Capabilities {
                authenticated: true,
                can_read: true,
                can_write: true,
                granted_scopes: vec!["session".to_owned()],
                display_identity: status
                    .phone_number
                    .unwrap_or_else(|| "whatsapp".to_owned()),
            },
            _ => Capabilities::unauthenticated(),
        }
    }

    async fn dry_run(
        &self,
        action: ActionType,
        payload: &serde_json::Value,
    ) -> Result<Preview, AdapterError> {
        require_in_catalog(Channel::Whatsapp, action)?;
        let message = MessagePayload::parse(payload)?;
        Ok(Preview {
            summary: format!(
                "Message to {} ({} chars)",
                message.recipient,
                message.text.chars().count()
            ),
            details: serde_json::json!({
                "recipient": message.recipient,
                "length": message.text.chars().count(),
            }),
        })
    }

    async fn execute(
        &self,
        action: ActionType,
        payload: &serde_json::Value,
    ) -> Result<ExecutionResult, AdapterError> {
        require_in_catalog(Channel::Whatsapp, action)?;
        let message = MessagePayload::parse(payload)?;

        let response = self
            .http
            .post(format!("{}/send", self.base_url))
            .json(&serde_json::json!({
                "jid": message.recipient,
                "text": message.text,
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), detail));
        }

        #[derive(Deserialize)]
        struct SendData {
            message_id: Option<String>,
        }
        let body: BridgeResponse<SendData> = response.json().await?;
        let message_id = body
            .data
            .and_then(|d| d.message_id)
            .unwrap_or_else(|| "sent".to_owned());

        debug!(recipient = %message.recipient, "whatsapp message dispatched");
        Ok(ExecutionResult {
            object_id: message_id,
            endpoint_used: "bridge:/send".to_owned(),
            details: serde_json::json!({"recipient": message.recipient}),
        })
    }

    async fn list(&self, _query: &serde_json::Value) -> Result<serde_json::Value, AdapterError> {
        let unread = self.unread().await?;
        Ok(serde_json::json!({"unread": unread}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_payload_validation() {
        let ok = MessagePayload::parse(&serde_json::json!({
            "recipient": "4915123@s.whatsapp.net",
            "text": "running late",
        }))
        .expect("valid");
        assert_eq!(ok.recipient, "4915123@s.whatsapp.net");

        assert!(matches!(
            MessagePayload::parse(&serde_json::json!({
                "recipient": "no-jid", "text": "x"
            })),
            Err(AdapterError::Validation(_))
        ));
        assert!(MessagePayload::parse(&serde_json::json!({
            "recipient": "a@s.whatsapp.net", "text": "  "
        }))
        .is_err());
    }

    #[tokio::test]
    async fn test_dry_run_counts_chars() {
        let adapter = WhatsAppAdapter::new(DEFAULT_BRIDGE_URL.to_owned());
        let preview = adapter
            .dry_run(
                ActionType::SendMessage,
                &serde_json::json!({
                    "recipient": "4915123@s.whatsapp.net",
                    "text": "hello",
                }),
            )
            .await
            .expect("dry run is local");
        assert_eq!(preview.details["length"], 5);
    }

    #[tokio::test]
    async fn test_email_action_not_in_catalog() {
        let adapter = WhatsAppAdapter::new(DEFAULT_BRIDGE_URL.to_owned());
        let result = adapter
            .dry_run(ActionType::SendEmail, &serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(AdapterError::NotSupported { .. })));
    }
}
