//! Ticket-now, resolve-later session refresh for the automation consumer.

use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::provider::{CredentialProvider, NegotiationConfig};
use crate::session::generate_token;
use crate::storage::{JobOutcome, Lookup, SharedStore, StoreError};

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("registration data is empty")]
    EmptyRegistration,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("token is empty")]
    MissingToken,
    #[error("refresh for this token is still in progress")]
    Pending,
    #[error("no refresh result for this token")]
    NotFound,
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct IssuedToken {
    pub token: String,
    /// Completes once the outcome is stored; detached by the HTTP handler.
    pub handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct RefreshOrchestrator {
    provider: Arc<dyn CredentialProvider>,
    store: SharedStore,
    verbose: bool,
}

/// Registration data must be a non-empty object or array.
pub fn is_usable_registration(data: &Value) -> bool {
    match data {
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => false,
    }
}

impl RefreshOrchestrator {
    pub fn new(provider: Arc<dyn CredentialProvider>, store: SharedStore, verbose: bool) -> Self {
        Self {
            provider,
            store,
            verbose,
        }
    }

    /// Issue a token immediately and run the refresh in the background.
    ///
    /// The token reads as pending until the provider answers.
    pub async fn refresh(&self, registration: Value) -> Result<IssuedToken, RefreshError> {
        if !is_usable_registration(&registration) {
            return Err(RefreshError::EmptyRegistration);
        }

        let token = generate_token();
        self.store.reserve(&token).await?;
        counter!("cookie_relay_refresh_issued_total").increment(1);
        info!(%token, "refreshing session");

        let job = self.clone();
        let job_token = token.clone();
        let handle = tokio::spawn(async move {
            job.run(job_token, registration).await;
        });

        Ok(IssuedToken { token, handle })
    }

    async fn run(&self, token: String, registration: Value) {
        let config = NegotiationConfig::for_refresh(registration, self.verbose);
        let outcome = match self.provider.refresh(config).await {
            Ok(result) => {
                info!(%token, "session refreshed");
                counter!("cookie_relay_refresh_completed_total", "outcome" => "success").increment(1);
                JobOutcome::Success(result)
            }
            Err(err) => {
                warn!(%token, "session refresh failed: {}", err);
                counter!("cookie_relay_refresh_completed_total", "outcome" => "failure").increment(1);
                JobOutcome::Failure(err.to_string())
            }
        };
        if let Err(err) = self.store.put(&token, outcome).await {
            error!(%token, "failed to store refresh outcome: {}", err);
        }
    }

    /// Fetch the outcome for `token`. Reads are not destructive.
    pub async fn lookup(&self, token: &str) -> Result<Value, LookupError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(LookupError::MissingToken);
        }
        let result = match self.store.get(token).await? {
            Lookup::Pending => Err(LookupError::Pending),
            Lookup::Missing => Err(LookupError::NotFound),
            Lookup::Found(entry) => match entry.outcome {
                JobOutcome::Success(payload) => Ok(payload),
                JobOutcome::Failure(message) => Err(LookupError::Failed(message)),
            },
        };
        let label = match &result {
            Ok(_) => "found",
            Err(LookupError::Pending) => "pending",
            Err(LookupError::NotFound) => "missing",
            Err(_) => "failed",
        };
        counter!("cookie_relay_refresh_lookups_total", "result" => label).increment(1);
        debug!(%token, result = label, "refresh lookup");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use crate::storage::{InMemoryRefreshStore, DEFAULT_RETENTION};
    use crate::testing::ScriptedProvider;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;

    fn orchestrator(provider: &ScriptedProvider) -> (RefreshOrchestrator, InMemoryRefreshStore) {
        let store = InMemoryRefreshStore::new(DEFAULT_RETENTION);
        let orchestrator =
            RefreshOrchestrator::new(Arc::new(provider.clone()), Arc::new(store.clone()), false);
        (orchestrator, store)
    }

    #[test]
    fn registration_must_be_non_empty() {
        assert!(!is_usable_registration(&Value::Null));
        assert!(!is_usable_registration(&json!({})));
        assert!(!is_usable_registration(&json!([])));
        assert!(!is_usable_registration(&json!("")));
        assert!(!is_usable_registration(&json!("text")));
        assert!(is_usable_registration(&json!({"a": "b"})));
        assert!(is_usable_registration(&json!([1])));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_payload_creates_nothing() {
        let provider = ScriptedProvider::new();
        let (refresh, store) = orchestrator(&provider);
        assert!(matches!(
            refresh.refresh(json!({})).await,
            Err(RefreshError::EmptyRegistration)
        ));
        tokio::task::yield_now().await;
        assert!(store.is_empty());
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn token_is_pending_until_provider_answers() {
        let provider = ScriptedProvider::new();
        let (refresh, _store) = orchestrator(&provider);

        let issued = refresh.refresh(json!({"a": "b"})).await.unwrap();
        assert!(issued.token.len() >= 24);
        assert!(matches!(
            refresh.lookup(&issued.token).await,
            Err(LookupError::Pending)
        ));

        provider.complete_refresh(Ok(json!({"csrf": "fresh"})));
        issued.handle.await.unwrap();

        assert_eq!(
            refresh.lookup(&issued.token).await.unwrap(),
            json!({"csrf": "fresh"})
        );
        let sent = provider.last_refresh().unwrap();
        assert_eq!(sent.former_registration_data, Some(json!({"a": "b"})));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_stored_as_outcome() {
        let provider = ScriptedProvider::new();
        let (refresh, _store) = orchestrator(&provider);

        let issued = refresh.refresh(json!({"a": "b"})).await.unwrap();
        provider.complete_refresh(Err(ProviderError::Negotiation("cookie expired".into())));
        issued.handle.await.unwrap();

        match refresh.lookup(&issued.token).await {
            Err(LookupError::Failed(message)) => assert_eq!(message, "cookie expired"),
            other => panic!("unexpected lookup: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn outcome_expires_after_retention() {
        let provider = ScriptedProvider::new();
        let (refresh, _store) = orchestrator(&provider);

        let issued = refresh.refresh(json!({"a": "b"})).await.unwrap();
        provider.complete_refresh(Ok(json!({"csrf": "x"})));
        issued.handle.await.unwrap();

        tokio::time::advance(DEFAULT_RETENTION - Duration::from_secs(1)).await;
        assert!(refresh.lookup(&issued.token).await.is_ok());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(
            refresh.lookup(&issued.token).await,
            Err(LookupError::NotFound)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_are_never_reused() {
        let provider = ScriptedProvider::new();
        let (refresh, _store) = orchestrator(&provider);
        let mut seen = HashSet::new();
        for _ in 0..50 {
            let issued = refresh.refresh(json!({"a": "b"})).await.unwrap();
            assert!(seen.insert(issued.token));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn blank_and_unknown_tokens() {
        let provider = ScriptedProvider::new();
        let (refresh, _store) = orchestrator(&provider);
        assert!(matches!(
            refresh.lookup("  ").await,
            Err(LookupError::MissingToken)
        ));
        assert!(matches!(
            refresh.lookup("never-issued").await,
            Err(LookupError::NotFound)
        ));
    }
}
