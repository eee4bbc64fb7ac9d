//! Instagram adapter: Graph API media publishing and comment listing.
//!
//! Publishing is the documented two-step flow: create a media container,
//! then publish it. The dry-run validates the image URL and caption
//! against Graph limits without creating a container.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::credentials::{blobs, SecretsDir};
use crate::plan::{ActionType, Channel};

use super::{
    require_in_catalog, AdapterError, Capabilities, ChannelAdapter, ExecutionResult, Preview,
};

const GRAPH_API: &str = "https://graph.facebook.com/v21.0";

/// Graph caption limit in characters.
const CAPTION_CAP: usize = 2200;

/// Stored credentials blob (`instagram_credentials.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstagramCredentials {
    /// Long-lived Graph access token.
    pub access_token: String,
    /// Instagram business account id.
    pub business_account_id: String,
    /// Account handle for display.
    #[serde(default)]
    pub username: Option<String>,
}

/// Payload for `post_image`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImagePostPayload {
    /// Publicly reachable image URL (Graph fetches it server-side).
    pub image_url: String,
    /// Caption text.
    #[serde(default)]
    pub caption: String,
}

impl ImagePostPayload {
    /// Parse and validate the payload completely.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Validation`] for shape or field problems.
    pub fn parse(payload: &serde_json::Value) -> Result<Self, AdapterError> {
        let parsed: Self = serde_json::from_value(payload.clone())
            .map_err(|e| AdapterError::Validation(format!("image payload: {e}")))?;
        let url = Url::parse(&parsed.image_url)
            .map_err(|e| AdapterError::Validation(format!("image_url: {e}")))?;
        if url.scheme() != "https" {
            return Err(AdapterError::Validation(
                "image_url must be https (Graph fetches it server-side)".to_owned(),
            ));
        }
        if parsed.caption.chars().count() > CAPTION_CAP {
            return Err(AdapterError::Validation(format!(
                "caption exceeds {CAPTION_CAP} characters"
            )));
        }
        Ok(parsed)
    }
}

/// Instagram channel adapter.
#[derive(Debug)]
pub struct InstagramAdapter {
    secrets: SecretsDir,
    http: reqwest::Client,
}

impl InstagramAdapter {
    /// Create an adapter reading credentials lazily.
    pub fn new(secrets: SecretsDir) -> Self {
        Self {
            secrets,
            http: reqwest::Client::new(),
        }
    }

    fn credentials(&self) -> Result<InstagramCredentials, AdapterError> {
        Ok(self.secrets.load_json(blobs::INSTAGRAM)?)
    }

    async fn graph_post(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<serde_json::Value, AdapterError> {
        let response = self
            .http
            .post(format!("{GRAPH_API}/{path}"))
            .form(params)
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
impl ChannelAdapter for InstagramAdapter {
    fn channel(&self) -> Channel {
        Channel::Instagram
    }

    async fn capabilities(&self) -> Capabilities {
        match self.credentials() {
            Ok(creds) => Capabilities {
                authenticated: true,
                can_read: true,
                can_write: true,
                granted_scopes: vec!["instagram_content_publish".to_owned()],
                display_identity: creds
                    .username
                    .unwrap_or_else(|| format!("ig:{}", creds.business_account_id)),
            },
            Err(_) => Capabilities::unauthenticated(),
        }
    }

    async fn dry_run(
        &self,
        action: ActionType,
        payload: &serde_json::Value,
    ) -> Result<Preview, AdapterError> {
        require_in_catalog(Channel::Instagram, action)?;
        let post = ImagePostPayload::parse(payload)?;
        Ok(Preview {
            summary: format!(
                "Publish image {} with {}-char caption",
                post.image_url,
                post.caption.chars().count()
            ),
            details: serde_json::json!({
                "image_url": post.image_url,
                "caption": post.caption,
                "flow": ["media", "media_publish"],
            }),
        })
    }

    async fn execute(
        &self,
        action: ActionType,
        payload: &serde_json::Value,
    ) -> Result<ExecutionResult, AdapterError> {
        require_in_catalog(Channel::Instagram, action)?;
        let post = ImagePostPayload::parse(payload)?;
        let creds = self.credentials()?;

        // Step 1: create the media container.
        let container = self
            .graph_post(
                &format!("{}/media", creds.business_account_id),
                &[
                    ("image_url", post.image_url.as_str()),
                    ("caption", post.caption.as_str()),
                    ("access_token", creds.access_token.as_str()),
                ],
            )
            .await?;
        let container_id = container["id"]
            .as_str()
            .ok_or_else(|| AdapterError::Permanent("missing container id".to_owned()))?;

        // Step 2: publish it.
        let published = self
            .graph_post(
                &format!("{}/media_publish", creds.business_account_id),
                &[
                    ("creation_id", container_id),
                    ("access_token", creds.access_token.as_str()),
                ],
            )
            .await?;
        let media_id = published["id"].as_str().unwrap_or_default().to_owned();

        Ok(ExecutionResult {
            object_id: media_id,
            endpoint_used: format!("{}/media_publish", creds.business_account_id),
            details: serde_json::json!({"container_id": container_id}),
        })
    }

    async fn list(&self, query: &serde_json::Value) -> Result<serde_json::Value, AdapterError> {
        let creds = self.credentials()?;
        let limit = query["limit"].as_u64().unwrap_or(25).to_string();
        let response = self
            .http
            .get(format!("{GRAPH_API}/{}/media", creds.business_account_id))
            .query(&[
                ("fields", "id,caption,media_type,timestamp,comments_count"),
                ("limit", limit.as_str()),
                ("access_token", creds.access_token.as_str()),
            ])
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
        let creds = self.credentials()?;
        let response = self
            .http
            .get(format!("{GRAPH_API}/{id}"))
            .query(&[
                ("fields", "id,caption,media_type,timestamp,permalink"),
                ("access_token", creds.access_token.as_str()),
            ])
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
