//! LinkedIn adapter: versioned REST posts with documented fallbacks.
//!
//! Two upstream quirks live here, both required behaviour:
//! version headers must be `YYYYMM` (user-supplied `YYYYMMDD` is
//! truncated, anything else fails fast), and the posts endpoint migrated
//! from `v2/ugcPosts` to `rest/posts`; a 426 `NONEXISTENT_VERSION`
//! triggers exactly one same-call retry with the normalized version, and
//! an endpoint-migrated rejection triggers exactly one fallback to the
//! legacy endpoint, recorded in `endpoint_used`.
//!
//! Author identity resolves through a fallback chain (`/v2/me` when
//! scoped, else the OIDC `sub`) and is cached keyed by resolution method;
//! a method change invalidates the cache.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::credentials::{blobs, SecretsDir};
use crate::plan::{ActionType, Channel};

use super::{
    require_in_catalog, AdapterError, Capabilities, ChannelAdapter, ExecutionResult, Preview,
};

const API_BASE: &str = "https://api.linkedin.com";
const REST_POSTS: &str = "rest/posts";
const LEGACY_POSTS: &str = "v2/ugcPosts";

/// Cached identity blob file name inside the state directory.
const IDENTITY_CACHE: &str = "linkedin_identity.json";

/// Stored OAuth blob (`linkedin_token.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedInToken {
    /// Bearer access token.
    pub access_token: String,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Payload for `post_text` and `post_image`.
#[derive(Debug, Clone, Deserialize)]
pub struct PostPayload {
    /// Post commentary text.
    pub text: String,
    /// Path to an image file for `post_image`.
    #[serde(default)]
    pub image_path: Option<String>,
}

impl PostPayload {
    /// Parse and validate the payload for the given action.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Validation`] for shape or field problems.
    pub fn parse(
        action: ActionType,
        payload: &serde_json::Value,
    ) -> Result<Self, AdapterError> {
        let parsed: Self = serde_json::from_value(payload.clone())
            .map_err(|e| AdapterError::Validation(format!("post payload: {e}")))?;
        if parsed.text.trim().is_empty() {
            return Err(AdapterError::Validation("post text is empty".to_owned()));
        }
        if parsed.text.chars().count() > 3000 {
            return Err(AdapterError::Validation(
                "post text exceeds 3000 characters".to_owned(),
            ));
        }
        if action == ActionType::PostImage && parsed.image_path.is_none() {
            return Err(AdapterError::Validation(
                "post_image requires image_path".to_owned(),
            ));
        }
        Ok(parsed)
    }
}

/// Normalize a version header to `YYYYMM`.
///
/// `YYYYMMDD` input is truncated; six digits pass through; anything else
/// fails fast.
///
/// # Errors
///
/// Returns [`AdapterError::Validation`] for unknown formats.
pub fn normalize_version(version: &str) -> Result<String, AdapterError> {
    let digits = version.trim();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(AdapterError::Validation(format!(
            "version must be numeric YYYYMM or YYYYMMDD: {version}"
        )));
    }
    match digits.len() {
        6 => Ok(digits.to_owned()),
        8 => Ok(digits[..6].to_owned()),
        _ => Err(AdapterError::Validation(format!(
            "version must be YYYYMM or YYYYMMDD: {version}"
        ))),
    }
}

/// How the author URN was resolved, recorded in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMethod {
    /// `/v2/me` profile endpoint (requires a profile scope).
    Me,
    /// OIDC userinfo `sub` claim.
    OidcSub,
}

/// Cached author identity, keyed by resolution method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityBlob {
    /// Resolved author URN.
    pub urn: String,
    /// The method that produced it; a method change invalidates the cache.
    pub method: IdentityMethod,
}

/// Compose the `rest/posts` request body.
pub fn build_post_body(author: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "author": author,
        "commentary": text,
        "visibility": "PUBLIC",
        "distribution": {
            "feedDistribution": "MAIN_FEED",
            "targetEntities": [],
            "thirdPartyDistributionChannels": [],
        },
        "lifecycleState": "PUBLISHED",
        "isReshareDisabledByAuthor": false,
    })
}

/// LinkedIn channel adapter.
#[derive(Debug)]
pub struct LinkedInAdapter {
    secrets: SecretsDir,
    http: reqwest::Client,
    version: String,
    state_dir: PathBuf,
}

impl LinkedInAdapter {
    /// Create an adapter with the configured version header and a state
    /// directory for the identity cache.
    pub fn new(secrets: SecretsDir, version: String, state_dir: PathBuf) -> Self {
        Self {
            secrets,
            http: reqwest::Client::new(),
            version,
            state_dir,
        }
    }

    fn token(&self) -> Result<LinkedInToken, AdapterError> {
        Ok(self.secrets.load_json(blobs::LINKEDIN)?)
    }

    fn preferred_method(token: &LinkedInToken) -> IdentityMethod {
        let has_profile_scope = token
            .scopes
            .iter()
            .any(|s| s == "r_liteprofile" || s == "r_basicprofile" || s == "profile");
        if has_profile_scope {
            IdentityMethod::Me
        } else {
            IdentityMethod::OidcSub
        }
    }

    fn cached_identity(&self) -> Option<IdentityBlob> {
        let path = self.state_dir.join(IDENTITY_CACHE);
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn store_identity(&self, blob: &IdentityBlob) {
        let path = self.state_dir.join(IDENTITY_CACHE);
        if let Ok(text) = serde_json::to_string_pretty(blob) {
            let _ = std::fs::create_dir_all(&self.state_dir);
            let _ = std::fs::write(path, text);
        }
    }

    /// Resolve the author URN through the fallback chain, using the cache
    /// when its method still matches.
    async fn resolve_author(&self, token: &LinkedInToken) -> Result<IdentityBlob, AdapterError> {
        let preferred = Self::preferred_method(token);
        if let Some(cached) = self.cached_identity() {
            if cached.method == preferred {
                debug!(urn = %cached.urn, "linkedin identity cache hit");
                return Ok(cached);
            }
            info!("linkedin identity resolution method changed, cache invalidated");
        }

        let blob = match preferred {
            IdentityMethod::Me => match self.fetch_me(token).await {
                Ok(urn) => IdentityBlob {
                    urn,
                    method: IdentityMethod::Me,
                },
                // Scope looked sufficient but the endpoint is forbidden:
                // fall through to OIDC.
                Err(AdapterError::Auth(_)) => IdentityBlob {
                    urn: self.fetch_oidc_sub(token).await?,
                    method: IdentityMethod::OidcSub,
                },
                Err(other) => return Err(other),
            },
            IdentityMethod::OidcSub => IdentityBlob {
                urn: self.fetch_oidc_sub(token).await?,
                method: IdentityMethod::OidcSub,
            },
        };

        self.store_identity(&blob);
        Ok(blob)
    }

    async fn fetch_me(&self, token: &LinkedInToken) -> Result<String, AdapterError> {
        let response = self
            .http
            .get(format!("{API_BASE}/v2/me"))
            .bearer_auth(&token.access_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), detail));
        }
        let me: serde_json::Value = response.json().await?;
        let id = me["id"]
            .as_str()
            .ok_or_else(|| AdapterError::Permanent("missing id in /v2/me".to_owned()))?;
        Ok(format!("urn:li:person:{id}"))
    }

    async fn fetch_oidc_sub(&self, token: &LinkedInToken) -> Result<String, AdapterError> {
        let response = self
            .http
            .get(format!("{API_BASE}/v2/userinfo"))
            .bearer_auth(&token.access_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), detail));
        }
        let userinfo: serde_json::Value = response.json().await?;
        let sub = userinfo["sub"]
            .as_str()
            .ok_or_else(|| AdapterError::Permanent("missing sub in userinfo".to_owned()))?;
        Ok(format!("urn:li:person:{sub}"))
    }

    /// Create the post, handling the two documented fallbacks.
    async fn create_post(
        &self,
        token: &LinkedInToken,
        body: &serde_json::Value,
    ) -> Result<ExecutionResult, AdapterError> {
        let version = normalize_version(&self.version)?;

        let first = self.try_rest_post(token, body, &self.version).await;
        let response = match first {
            Err(RestPostFailure::NonexistentVersion) if self.version != version => {
                // One same-call retry with the truncated version.
                info!(from = %self.version, to = %version, "linkedin version normalized, retrying");
                self.try_rest_post(token, body, &version)
                    .await
                    .map_err(RestPostFailure::into_error)?
            }
            Err(RestPostFailure::EndpointMigrated) => {
                // Documented backup endpoint, reported in endpoint_used.
                info!("linkedin rest/posts migrated, falling back to legacy endpoint");
                return self.try_legacy_post(token, body).await;
            }
            Err(other) => return Err(other.into_error()),
            Ok(response) => response,
        };

        Ok(ExecutionResult {
            object_id: response,
            endpoint_used: REST_POSTS.to_owned(),
            details: serde_json::json!({"version": version}),
        })
    }

    async fn try_rest_post(
        &self,
        token: &LinkedInToken,
        body: &serde_json::Value,
        version: &str,
    ) -> Result<String, RestPostFailure> {
        let response = self
            .http
            .post(format!("{API_BASE}/{REST_POSTS}"))
            .bearer_auth(&token.access_token)
            .header("LinkedIn-Version", version)
            .header("X-Restli-Protocol-Version", "2.0.0")
            .json(body)
            .send()
            .await
            .map_err(|e| RestPostFailure::Other(e.into()))?;

        let status = response.status();
        if status.is_success() {
            let id = response
                .headers()
                .get("x-restli-id")
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned);
            let parsed: serde_json::Value = response.json().await.unwrap_or_default();
            return Ok(id
                .or_else(|| parsed["id"].as_str().map(ToOwned::to_owned))
                .unwrap_or_default());
        }

        let detail = response.text().await.unwrap_or_default();
        if status.as_u16() == 426 || detail.contains("NONEXISTENT_VERSION") {
            Err(RestPostFailure::NonexistentVersion)
        } else if detail.contains("ENDPOINT_MIGRATED") || status.as_u16() == 410 {
            Err(RestPostFailure::EndpointMigrated)
        } else {
            Err(RestPostFailure::Other(AdapterError::from_status(
                status.as_u16(),
                detail,
            )))
        }
    }

    /// Upload an image through the versioned images API: initialize the
    /// upload, PUT the bytes, return the image URN for the post content.
    async fn upload_image(
        &self,
        token: &LinkedInToken,
        owner_urn: &str,
        image_path: &str,
    ) -> Result<String, AdapterError> {
        let bytes = std::fs::read(image_path).map_err(|e| {
            AdapterError::Validation(format!("image unreadable at {image_path}: {e}"))
        })?;
        let version = normalize_version(&self.version)?;

        let init = self
            .http
            .post(format!("{API_BASE}/rest/images?action=initializeUpload"))
            .bearer_auth(&token.access_token)
            .header("LinkedIn-Version", version.clone())
            .header("X-Restli-Protocol-Version", "2.0.0")
            .json(&serde_json::json!({
                "initializeUploadRequest": {"owner": owner_urn},
            }))
            .send()
            .await?;
        let status = init.status();
        if !status.is_success() {
            let detail = init.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), detail));
        }
        let init_body: serde_json::Value = init.json().await?;
        let upload_url = init_body["value"]["uploadUrl"]
            .as_str()
            .ok_or_else(|| AdapterError::Permanent("missing uploadUrl".to_owned()))?
            .to_owned();
        let image_urn = init_body["value"]["image"]
            .as_str()
            .ok_or_else(|| AdapterError::Permanent("missing image urn".to_owned()))?
            .to_owned();

        let put = self
            .http
            .put(upload_url)
            .bearer_auth(&token.access_token)
            .body(bytes)
            .send()
            .await?;
        let status = put.status();
        if !status.is_success() {
            let detail = put.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), detail));
        }
        Ok(image_urn)
    }

    async fn try_legacy_post(
        &self,
        token: &LinkedInToken,
        body: &serde_json::Value,
    ) -> Result<ExecutionResult, AdapterError> {
        let author = body["author"].as_str().unwrap_or_default();
        let text = body["commentary"].as_str().unwrap_or_default();
        let legacy_body = serde_json::json!({
            "author": author,
            "lifecycleState": "PUBLISHED",
            "specificContent": {
                "com.linkedin.ugc.ShareContent": {
                    "shareCommentary": {"text": text},
                    "shareMediaCategory": "NONE",
                },
            },
            "visibility": {"com.linkedin.ugc.MemberNetworkVisibility": "PUBLIC"},
        });
        let response = self
            .http
            .post(format!("{API_BASE}/{LEGACY_POSTS}"))
            .bearer_auth(&token.access_token)
            .header("X-Restli-Protocol-Version", "2.0.0")
            .json(&legacy_body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), detail));
        }
        let parsed: serde_json::Value = response.json().await?;
        Ok(ExecutionResult {
            object_id: parsed["id"].as_str().unwrap_or_default().to_owned(),
            endpoint_used: LEGACY_POSTS.to_owned(),
            details: serde_json::json!({"fallback": "endpoint-migrated"}),
        })
    }
}

/// Internal classification of a `rest/posts` failure.
enum RestPostFailure {
    NonexistentVersion,
    EndpointMigrated,
    Other(AdapterError),
}

impl RestPostFailure {
    fn into_error(self) -> AdapterError {
        match self {
            Self::NonexistentVersion => {
                AdapterError::Permanent("NONEXISTENT_VERSION after normalization".to_owned())
            }
            Self::EndpointMigrated => {
                AdapterError::Permanent("endpoint migrated twice".to_owned())
            }
            Self::Other(e) => e,
        }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for LinkedInAdapter {
    fn channel(&self) -> Channel {
        Channel::Linkedin
    }

    async fn capabilities(&self) -> Capabilities {
        match self.token() {
            Ok(token) => {
                let identity = self
                    .cached_identity()
                    .map(|b| b.urn)
                    .unwrap_or_else(|| "linkedin".to_owned());
                Capabilities {
                    authenticated: true,
                    can_read: true,
                    can_write: token.scopes.iter().any(|s| s == "w_member_social"),
                    granted_scopes: token.scopes,
                    display_identity: identity,
                }
            }
            Err(_) => Capabilities::unauthenticated(),
        }
    }

    async fn dry_run(
        &self,
        action: ActionType,
        payload: &serde_json::Value,
    ) -> Result<Preview, AdapterError> {
        require_in_catalog(Channel::Linkedin, action)?;
        let post = PostPayload::parse(action, payload)?;
        let version = normalize_version(&self.version)?;
        let token = self.token()?;
        let identity = self.resolve_author(&token).await?;
        let body = build_post_body(&identity.urn, &post.text);
        Ok(Preview {
            summary: format!(
                "Post as {} ({} chars, version {version})",
                identity.urn,
                post.text.chars().count()
            ),
            details: serde_json::json!({
                "author": identity.urn,
                "resolution_method": identity.method,
                "body": body,
                "image_path": post.image_path,
            }),
        })
    }

    async fn execute(
        &self,
        action: ActionType,
        payload: &serde_json::Value,
    ) -> Result<ExecutionResult, AdapterError> {
        require_in_catalog(Channel::Linkedin, action)?;
        let post = PostPayload::parse(action, payload)?;
        let token = self.token()?;
        let identity = self.resolve_author(&token).await?;
        let mut body = build_post_body(&identity.urn, &post.text);
        if let Some(ref image_path) = post.image_path {
            let image_urn = self.upload_image(&token, &identity.urn, image_path).await?;
            if let Some(obj) = body.as_object_mut() {
                obj.insert(
                    "content".to_owned(),
                    serde_json::json!({"media": {"id": image_urn}}),
                );
            }
        }
        let mut result = self.create_post(&token, &body).await?;
        if let Some(obj) = result.details.as_object_mut() {
            obj.insert(
                "author_resolution".to_owned(),
                serde_json::json!(identity.method),
            );
        }
        Ok(result)
    }

    async fn list(&self, query: &serde_json::Value) -> Result<serde_json::Value, AdapterError> {
        let token = self.token()?;
        let identity = self.resolve_author(&token).await?;
        let count = query["limit"].as_u64().unwrap_or(10).to_string();
        let version = normalize_version(&self.version)?;
        let response = self
            .http
            .get(format!("{API_BASE}/{REST_POSTS}"))
            .bearer_auth(&token.access_token)
            .header("LinkedIn-Version", version)
            .header("X-Restli-Protocol-Version", "2.0.0")
            .query(&[
                ("q", "author"),
                ("author", identity.urn.as_str()),
                ("count", count.as_str()),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_version() {
        assert_eq!(normalize_version("202502").expect("six"), "202502");
        assert_eq!(normalize_version("20250201").expect("eight"), "202502");
        assert!(normalize_version("2025").is_err());
        assert!(normalize_version("februar").is_err());
        assert!(normalize_version("2025-02").is_err());
    }

    #[test]
    fn test_post_payload_validation() {
        let ok = PostPayload::parse(
            ActionType::PostText,
            &serde_json::json!({"text": "hello network"}),
        )
        .expect("valid");
        assert_eq!(ok.text, "hello network");

        assert!(PostPayload::parse(ActionType::PostText, &serde_json::json!({"text": "  "}))
            .is_err());
        assert!(PostPayload::parse(
            ActionType::PostImage,
            &serde_json::json!({"text": "pic"})
        )
        .is_err());
        assert!(PostPayload::parse(
            ActionType::PostText,
            &serde_json::json!({"text": "x".repeat(3001)})
        )
        .is_err());
    }

    #[test]
    fn test_build_post_body() {
        let body = build_post_body("urn:li:person:abc", "hello");
        assert_eq!(body["author"], "urn:li:person:abc");
        assert_eq!(body["commentary"], "hello");
        assert_eq!(body["lifecycleState"], "PUBLISHED");
    }

    #[test]
    fn test_identity_cache_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = LinkedInAdapter::new(
            SecretsDir::new(dir.path().join("secrets")),
            "202502".to_owned(),
            dir.path().join("state"),
        );

        assert!(adapter.cached_identity().is_none());
        adapter.store_identity(&IdentityBlob {
            urn: "urn:li:person:xyz".to_owned(),
            method: IdentityMethod::OidcSub,
        });
        let cached = adapter.cached_identity().expect("cached");
        assert_eq!(cached.urn, "urn:li:person:xyz");
        assert_eq!(cached.method, IdentityMethod::OidcSub);
    }

    #[test]
    fn test_preferred_method_follows_scopes() {
        let scoped = LinkedInToken {
            access_token: "t".to_owned(),
            scopes: vec!["r_liteprofile".to_owned(), "w_member_social".to_owned()],
        };
        assert_eq!(
            LinkedInAdapter::preferred_method(&scoped),
            IdentityMethod::Me
        );

        let oidc_only = LinkedInToken {
            access_token: "t".to_owned(),
            scopes: vec!["openid".to_owned(), "w_member_social".to_owned()],
        };
        assert_eq!(
            LinkedInAdapter::preferred_method(&oidc_only),
            IdentityMethod::OidcSub
        );
    }
}
