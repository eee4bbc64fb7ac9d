//! Channel adapters: the only code that talks to external systems.
//!
//! Every adapter exposes the same narrow surface: capability probing, a
//! non-mutating `dry_run` that produces the fullest obtainable preview,
//! the `execute` mutation itself, and optional read paths used by the
//! watchers. Adapters own token refresh, rate limits, and wire formats;
//! the executor only sees [`AdapterError`] classifications.

pub mod gmail;
pub mod instagram;
pub mod linkedin;
pub mod mock;
pub mod odoo;
pub mod whatsapp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AdaptersConfig;
use crate::credentials::{CredentialsError, SecretsDir};
use crate::plan::{ActionType, Channel};

/// Adapter failure, classified for the retry layer.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Credentials missing, expired beyond refresh, or lacking scope.
    /// Never retried; watcher health degrades, executor fails the plan.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Network failure, 5xx, or 429. Retried unless the action is
    /// no-retry.
    #[error("transient upstream failure: {0}")]
    Transient(String),
    /// 4xx other than 429, or an upstream rejection that will not heal.
    #[error("permanent upstream failure: {0}")]
    Permanent(String),
    /// The payload does not validate against the adapter's schema.
    #[error("payload validation failed: {0}")]
    Validation(String),
    /// The action is not in this adapter's catalog.
    #[error("action {action} not supported on channel {channel}")]
    NotSupported {
        /// The adapter's channel.
        channel: Channel,
        /// The unsupported action.
        action: ActionType,
    },
}

impl AdapterError {
    /// Whether the retry layer may re-invoke the call (no-retry actions
    /// override this to false at every layer).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether this is an authentication failure (watcher degradation
    /// trigger).
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Classify an HTTP status + detail into an adapter error.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            401 | 403 => Self::Auth(format!("HTTP {status}: {detail}")),
            429 => Self::Transient(format!("HTTP 429: {detail}")),
            500..=599 => Self::Transient(format!("HTTP {status}: {detail}")),
            _ => Self::Permanent(format!("HTTP {status}: {detail}")),
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::Transient(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}

impl From<CredentialsError> for AdapterError {
    fn from(err: CredentialsError) -> Self {
        Self::Auth(err.to_string())
    }
}

/// What an adapter can currently do, per its credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// Whether usable credentials are present.
    pub authenticated: bool,
    /// Whether read paths are available.
    pub can_read: bool,
    /// Whether write (mutating) paths are available.
    pub can_write: bool,
    /// OAuth scopes or equivalent grants.
    pub granted_scopes: Vec<String>,
    /// Human-readable identity the adapter acts as.
    pub display_identity: String,
}

impl Capabilities {
    /// Capabilities of an unauthenticated adapter.
    pub fn unauthenticated() -> Self {
        Self {
            authenticated: false,
            can_read: false,
            can_write: false,
            granted_scopes: Vec::new(),
            display_identity: "unauthenticated".to_owned(),
        }
    }
}

/// The fullest preview obtainable without mutating anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preview {
    /// One-line human summary for the plan document.
    pub summary: String,
    /// Structured preview detail attached to the plan result.
    pub details: serde_json::Value,
}

/// Result of a successful `execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Upstream object id or URN created/affected.
    pub object_id: String,
    /// The endpoint actually used (records documented fallbacks).
    pub endpoint_used: String,
    /// Additional structured detail.
    pub details: serde_json::Value,
}

/// Whether adapters hit live APIs or produce synthetic results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterMode {
    /// Deterministic synthetic results, no network I/O.
    Mock,
    /// Live third-party APIs.
    Real,
}

impl AdapterMode {
    /// Parse the `--mode` flag value.
    ///
    /// # Errors
    ///
    /// Returns the offending string for anything but `mock`/`real`.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "mock" => Ok(Self::Mock),
            "real" => Ok(Self::Real),
            other => Err(other.to_owned()),
        }
    }
}

/// Uniform adapter surface consumed by the executor and the watchers.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// The channel this adapter serves.
    fn channel(&self) -> Channel;

    /// Probe current credentials and grants. Pure: no persistent side
    /// effects.
    async fn capabilities(&self) -> Capabilities;

    /// Validate the payload completely and produce the most faithful
    /// preview obtainable without any mutating remote call.
    async fn dry_run(
        &self,
        action: ActionType,
        payload: &serde_json::Value,
    ) -> Result<Preview, AdapterError>;

    /// Perform the mutation. The result carries the upstream object id and
    /// the endpoint used.
    async fn execute(
        &self,
        action: ActionType,
        payload: &serde_json::Value,
    ) -> Result<ExecutionResult, AdapterError>;

    /// Optional read path used by watchers and preview surfaces.
    async fn list(&self, _query: &serde_json::Value) -> Result<serde_json::Value, AdapterError> {
        Err(AdapterError::Validation(format!(
            "channel {} has no list path",
            self.channel()
        )))
    }

    /// Optional single-object read path.
    async fn read(&self, _id: &str) -> Result<serde_json::Value, AdapterError> {
        Err(AdapterError::Validation(format!(
            "channel {} has no read path",
            self.channel()
        )))
    }
}

/// Check an action against a channel's catalog before dispatch.
///
/// # Errors
///
/// Returns [`AdapterError::NotSupported`] when the action does not belong
/// to the channel.
pub fn require_in_catalog(channel: Channel, action: ActionType) -> Result<(), AdapterError> {
    if action.belongs_to(channel) {
        Ok(())
    } else {
        Err(AdapterError::NotSupported { channel, action })
    }
}

/// Resolves adapters by channel.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("channels", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AdapterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter for its channel, replacing any existing one.
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.channel(), adapter);
    }

    /// Resolve the adapter for a channel.
    pub fn resolve(&self, channel: Channel) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel).cloned()
    }

    /// Channels with a registered adapter.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.adapters.keys().copied().collect();
        channels.sort_by_key(Channel::as_str);
        channels
    }

    /// Build the default registry for the configured mode.
    ///
    /// Mock mode wires a deterministic [`mock::MockAdapter`] per cataloged
    /// channel; real mode wires the live adapters against the secrets
    /// directory. Channels without a cataloged action (`filesystem`,
    /// `twitter`) get no adapter; executing against them is a
    /// precondition failure.
    pub fn with_defaults(
        mode: AdapterMode,
        config: &AdaptersConfig,
        secrets: &SecretsDir,
    ) -> Self {
        let mut registry = Self::new();
        match mode {
            AdapterMode::Mock => {
                for channel in [
                    Channel::Gmail,
                    Channel::Whatsapp,
                    Channel::Linkedin,
                    Channel::Instagram,
                    Channel::Odoo,
                ] {
                    registry.register(Arc::new(mock::MockAdapter::succeeding(channel)));
                }
            }
            AdapterMode::Real => {
                registry.register(Arc::new(gmail::GmailAdapter::new(secrets.clone())));
                registry.register(Arc::new(whatsapp::WhatsAppAdapter::new(
                    config.whatsapp_bridge_url.clone(),
                )));
                registry.register(Arc::new(linkedin::LinkedInAdapter::new(
                    secrets.clone(),
                    config.linkedin_version.clone(),
                    config.state_dir.clone(),
                )));
                registry.register(Arc::new(instagram::InstagramAdapter::new(secrets.clone())));
                registry.register(Arc::new(odoo::OdooAdapter::new(secrets.clone())));
            }
        }
        registry
    }
}
