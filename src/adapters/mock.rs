//! Scriptable mock adapter: deterministic synthetic results for
//! `--mode mock` runs and failure injection in tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::plan::{ActionType, Channel};

use super::{
    require_in_catalog, AdapterError, Capabilities, ChannelAdapter, ExecutionResult, Preview,
};

/// One scripted `execute` outcome.
type ScriptedOutcome = Result<ExecutionResult, AdapterError>;

/// Mock adapter with an optional script of outcomes.
///
/// Without a script every `execute` succeeds with a synthetic object id.
/// With one, outcomes are consumed front to back; when the script runs dry
/// the adapter falls back to synthetic success. Every call is recorded so
/// tests can assert exact invocation counts (the no-retry property).
pub struct MockAdapter {
    channel: Channel,
    script: Mutex<VecDeque<ScriptedOutcome>>,
    calls: Mutex<Vec<(ActionType, serde_json::Value)>>,
    authenticated: bool,
}

impl std::fmt::Debug for MockAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAdapter")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl MockAdapter {
    /// A mock adapter whose every call succeeds.
    pub fn succeeding(channel: Channel) -> Self {
        Self {
            channel,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            authenticated: true,
        }
    }

    /// A mock adapter that plays back the given outcomes in order.
    pub fn scripted(channel: Channel, outcomes: Vec<ScriptedOutcome>) -> Self {
        Self {
            channel,
            script: Mutex::new(outcomes.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
            authenticated: true,
        }
    }

    /// A mock adapter whose credentials are absent.
    pub fn unauthenticated(channel: Channel) -> Self {
        Self {
            channel,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            authenticated: false,
        }
    }

    /// Number of `execute` calls made so far.
    pub fn execute_calls(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Recorded `execute` calls (action + payload).
    pub fn recorded_calls(&self) -> Vec<(ActionType, serde_json::Value)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn synthetic_result(&self, action: ActionType) -> ExecutionResult {
        let n = self.execute_calls();
        ExecutionResult {
            object_id: format!("mock-{}-{}-{n}", self.channel, action),
            endpoint_used: format!("mock://{}/{action}", self.channel),
            details: serde_json::json!({"mock": true}),
        }
    }
}

#[async_trait]
impl ChannelAdapter for MockAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn capabilities(&self) -> Capabilities {
        if self.authenticated {
            Capabilities {
                authenticated: true,
                can_read: true,
                can_write: true,
                granted_scopes: vec!["mock".to_owned()],
                display_identity: format!("mock:{}", self.channel),
            }
        } else {
            Capabilities::unauthenticated()
        }
    }

    async fn dry_run(
        &self,
        action: ActionType,
        payload: &serde_json::Value,
    ) -> Result<Preview, AdapterError> {
        require_in_catalog(self.channel, action)?;
        if !self.authenticated {
            return Err(AdapterError::Auth("mock adapter unauthenticated".to_owned()));
        }
        if !payload.is_object() {
            return Err(AdapterError::Validation(
                "payload must be a JSON object".to_owned(),
            ));
        }
        Ok(Preview {
            summary: format!("mock preview of {action} on {}", self.channel),
            details: payload.clone(),
        })
    }

    async fn execute(
        &self,
        action: ActionType,
        payload: &serde_json::Value,
    ) -> Result<ExecutionResult, AdapterError> {
        require_in_catalog(self.channel, action)?;
        if !self.authenticated {
            return Err(AdapterError::Auth("mock adapter unauthenticated".to_owned()));
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((action, payload.clone()));
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(outcome) => outcome,
            None => Ok(self.synthetic_result(action)),
        }
    }

    async fn list(&self, query: &serde_json::Value) -> Result<serde_json::Value, AdapterError> {
        if !self.authenticated {
            return Err(AdapterError::Auth("mock adapter unauthenticated".to_owned()));
        }
        Ok(serde_json::json!({"items": [], "query": query}))
    }

    async fn read(&self, id: &str) -> Result<serde_json::Value, AdapterError> {
        Ok(serde_json::json!({"id": id, "mock": true}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_succeeding_mock_records_calls() {
        let mock = MockAdapter::succeeding(Channel::Gmail);
        let payload = serde_json::json!({"to": "a@b.com"});
        let result = mock
            .execute(ActionType::SendEmail, &payload)
            .await
            .expect("execute");
        assert!(result.object_id.starts_with("mock-gmail-send_email"));
        assert_eq!(mock.execute_calls(), 1);
        assert_eq!(mock.recorded_calls()[0].0, ActionType::SendEmail);
    }

    #[tokio::test]
    async fn test_scripted_outcomes_in_order() {
        let mock = MockAdapter::scripted(
            Channel::Odoo,
            vec![
                Err(AdapterError::Transient("reset".to_owned())),
                Ok(ExecutionResult {
                    object_id: "inv-42".to_owned(),
                    endpoint_used: "mock://odoo".to_owned(),
                    details: serde_json::json!({}),
                }),
            ],
        );
        let payload = serde_json::json!({"invoice_id": 42});
        let first = mock.execute(ActionType::CreateInvoice, &payload).await;
        assert!(matches!(first, Err(AdapterError::Transient(_))));
        let second = mock
            .execute(ActionType::CreateInvoice, &payload)
            .await
            .expect("second");
        assert_eq!(second.object_id, "inv-42");
        assert_eq!(mock.execute_calls(), 2);
    }

    #[tokio::test]
    async fn test_unauthenticated_mock_fails_auth() {
        let mock = MockAdapter::unauthenticated(Channel::Linkedin);
        let result = mock
            .dry_run(ActionType::PostText, &serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(AdapterError::Auth(_))));
        assert!(!mock.capabilities().await.authenticated);
    }

    #[tokio::test]
    async fn test_catalog_enforced() {
        let mock = MockAdapter::succeeding(Channel::Gmail);
        let result = mock
            .execute(ActionType::RegisterPayment, &serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(AdapterError::NotSupported { .. })));
        assert_eq!(mock.execute_calls(), 0, "rejected before recording");
    }
}
