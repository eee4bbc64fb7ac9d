//! Gmail adapter: local MIME assembly, send/draft mutations, and the
//! message listing used by the gmail watcher.
//!
//! The dry-run assembles the exact MIME that `execute` would send and
//! reports recipient and size, so the preview is byte-faithful to the
//! eventual mutation.

use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::credentials::{blobs, SecretsDir};
use crate::plan::{ActionType, Channel};

use super::{
    require_in_catalog, AdapterError, Capabilities, ChannelAdapter, ExecutionResult, Preview,
};

const GMAIL_API: &str = "https://gmail.googleapis.com/gmail/v1";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Seconds of validity below which a cached access token is refreshed.
const TOKEN_SLACK_SECS: i64 = 60;

/// Stored OAuth blob (`gmail_token.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailToken {
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// Long-lived refresh token.
    pub refresh_token: String,
    /// Current access token, if one has been minted.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Access token expiry as epoch seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// The account's email address, when known.
    #[serde(default)]
    pub email: Option<String>,
}

/// Payload for `send_email` and `draft_email`.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailPayload {
    /// Primary recipient.
    pub to: String,
    /// Carbon-copy recipients.
    #[serde(default)]
    pub cc: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

impl EmailPayload {
    /// Parse and validate the payload completely.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Validation`] for shape or field problems.
    pub fn parse(payload: &serde_json::Value) -> Result<Self, AdapterError> {
        let parsed: Self = serde_json::from_value(payload.clone())
            .map_err(|e| AdapterError::Validation(format!("email payload: {e}")))?;
        if !parsed.to.contains('@') {
            return Err(AdapterError::Validation(format!(
                "recipient is not an address: {}",
                parsed.to
            )));
        }
        if let Some(bad) = parsed.cc.iter().find(|cc| !cc.contains('@')) {
            return Err(AdapterError::Validation(format!(
                "cc entry is not an address: {bad}"
            )));
        }
        if parsed.subject.trim().is_empty() {
            return Err(AdapterError::Validation("subject is empty".to_owned()));
        }
        Ok(parsed)
    }
}

/// Assemble the RFC 2822 message `execute` will send.
pub fn build_mime(payload: &EmailPayload) -> String {
    let mut mime = format!("To: {}\r\n", payload.to);
    if !payload.cc.is_empty() {
        mime.push_str(&format!("Cc: {}\r\n", payload.cc.join(", ")));
    }
    mime.push_str(&format!("Subject: {}\r\n", payload.subject));
    mime.push_str("MIME-Version: 1.0\r\n");
    mime.push_str("Content-Type: text/plain; charset=\"UTF-8\"\r\n");
    mime.push_str("Content-Transfer-Encoding: base64\r\n\r\n");
    mime.push_str(&base64::engine::general_purpose::STANDARD.encode(payload.body.as_bytes()));
    mime
}

/// Encode a MIME message the way the API expects (`raw` field).
pub fn encode_raw(mime: &str) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mime.as_bytes())
}

/// Decode the base64 body of a [`build_mime`] message (round-trip checks).
pub fn decode_mime_body(mime: &str) -> Option<String> {
    let body_b64 = mime.split("\r\n\r\n").nth(1)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(body_b64)
        .ok()?;
    String::from_utf8(bytes).ok()
}

/// Gmail channel adapter.
#[derive(Debug)]
pub struct GmailAdapter {
    secrets: SecretsDir,
    http: reqwest::Client,
}

impl GmailAdapter {
    /// Create an adapter reading credentials lazily from the secrets
    /// directory.
    pub fn new(secrets: SecretsDir) -> Self {
        Self {
            secrets,
            http: reqwest::Client::new(),
        }
    }

    /// Resolve a usable access token, refreshing at most once per call.
    ///
    /// Refresh failures are authentication errors, never transient.
    async fn access_token(&self) -> Result<String, AdapterError> {
        let mut blob: GmailToken = self.secrets.load_json(blobs::GMAIL)?;
        let now = Utc::now().timestamp();

        if let (Some(token), Some(expires_at)) = (&blob.access_token, blob.expires_at) {
            if expires_at.saturating_sub(now) > TOKEN_SLACK_SECS {
                return Ok(token.clone());
            }
        }

        debug!("gmail access token expired, refreshing");
        let response = self
            .http
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("client_id", blob.client_id.as_str()),
                ("client_secret", blob.client_secret.as_str()),
                ("refresh_token", blob.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| AdapterError::Auth(format!("token refresh failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Auth(format!(
                "token refresh rejected (HTTP {status}): {body}"
            )));
        }

        #[derive(Deserialize)]
        struct RefreshResponse {
            access_token: String,
            expires_in: i64,
        }
        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Auth(format!("token refresh parse: {e}")))?;

        blob.access_token = Some(refreshed.access_token.clone());
        blob.expires_at = Some(now.saturating_add(refreshed.expires_in));
        self.secrets.store_json(blobs::GMAIL, &blob)?;
        Ok(refreshed.access_token)
    }

    async fn post_json(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, AdapterError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{GMAIL_API}/{endpoint}"))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), detail));
        }
        Ok(response.json().await?)
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for GmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Gmail
    }

    async fn capabilities(&self) -> Capabilities {
        match self.secrets.load_json::<GmailToken>(blobs::GMAIL) {
            Ok(blob) => Capabilities {
                authenticated: true,
                can_read: true,
                can_write: blob
                    .scopes
                    .iter()
                    .any(|s| s.contains("gmail.send") || s.contains("mail.google.com")),
                granted_scopes: blob.scopes,
                display_identity: blob.email.unwrap_or_else(|| "gmail".to_owned()),
            },
            Err(_) => Capabilities::unauthenticated(),
        }
    }

    async fn dry_run(
        &self,
        action: ActionType,
        payload: &serde_json::Value,
    ) -> Result<Preview, AdapterError> {
        require_in_catalog(Channel::Gmail, action)?;
        let email = EmailPayload::parse(payload)?;
        let mime = build_mime(&email);
        Ok(Preview {
            summary: format!(
                "To: {}, Subject: {}, Size: {} bytes",
                email.to,
                email.subject,
                mime.len()
            ),
            details: serde_json::json!({
                "to": email.to,
                "cc": email.cc,
                "subject": email.subject,
                "mime_size": mime.len(),
                "delivery": action.as_str(),
            }),
        })
    }

    async fn execute(
        &self,
        action: ActionType,
        payload: &serde_json::Value,
    ) -> Result<ExecutionResult, AdapterError> {
        require_in_catalog(Channel::Gmail, action)?;
        let email = EmailPayload::parse(payload)?;
        let raw = encode_raw(&build_mime(&email));

        match action {
            ActionType::SendEmail => {
                let endpoint = "users/me/messages/send";
                let result = self
                    .post_json(endpoint, &serde_json::json!({"raw": raw}))
                    .await?;
                let id = result["id"].as_str().unwrap_or_default().to_owned();
                Ok(ExecutionResult {
                    object_id: id,
                    endpoint_used: endpoint.to_owned(),
                    details: serde_json::json!({
                        "thread_id": result["threadId"],
                    }),
                })
            }
            ActionType::DraftEmail => {
                let endpoint = "users/me/drafts";
                let result = self
                    .post_json(endpoint, &serde_json::json!({"message": {"raw": raw}}))
                    .await?;
                let id = result["id"].as_str().unwrap_or_default().to_owned();
                Ok(ExecutionResult {
                    object_id: id,
                    endpoint_used: endpoint.to_owned(),
                    details: serde_json::json!({
                        "message_id": result["message"]["id"],
                    }),
                })
            }
            other => Err(AdapterError::NotSupported {
                channel: Channel::Gmail,
                action: other,
            }),
        }
    }

    async fn list(&self, query: &serde_json::Value) -> Result<serde_json::Value, AdapterError> {
        let token = self.access_token().await?;
        let q = query["q"].as_str().unwrap_or("is:unread");
        let max = query["max_results"].as_u64().unwrap_or(25);
        let response = self
            .http
            .get(format!("{GMAIL_API}/users/me/messages"))
            .bearer_auth(token)
            .query(&[("q", q), ("maxResults", &max.to_string())])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), detail));
        }
        Ok(response.json().await?)
    }

    async fn read(&self, id: &str) -> Result<serde_json::Value, AdapterError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{GMAIL_API}/users/me/messages/{id}"))
            .bearer_auth(token)
            .query(&[
                ("format", "metadata"),
                ("metadataHeaders", "From"),
                ("metadataHeaders", "Subject"),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), detail));
        }
        let message: serde_json::Value = response.json().await?;
        Ok(flatten_message(&message))
    }
}

/// Flatten the metadata response into the fields the watcher needs.
fn flatten_message(message: &serde_json::Value) -> serde_json::Value {
    let mut from = String::new();
    let mut subject = String::new();
    if let Some(headers) = message["payload"]["headers"].as_array() {
        for header in headers {
            match header["name"].as_str() {
                Some("From") => from = header["value"].as_str().unwrap_or_default().to_owned(),
                Some("Subject") => {
                    subject = header["value"].as_str().unwrap_or_default().to_owned();
                }
                _ => {}
            }
        }
    }
    serde_json::json!({
        "id": message["id"],
        "thread_id": message["threadId"],
        "from": from,
        "subject": subject,
        "snippet": message["snippet"],
        "has_attachments": message["payload"]["parts"]
            .as_array()
            .is_some_and(|parts| parts.iter().any(|p| p["filename"].as_str().is_some_and(|f| !f.is_empty()))),
    })
}
