//! In-process credential provider for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::provider::{CredentialProvider, NegotiationConfig, NegotiationRound, ProviderError};
use crate::session::AccountCredentials;

/// Replays scripted negotiation rounds and completes refreshes on demand.
///
/// `refresh` blocks until the test calls [`ScriptedProvider::complete_refresh`],
/// so tests decide exactly when a job finishes.
#[derive(Clone)]
pub struct ScriptedProvider {
    inner: Arc<Inner>,
}

struct Inner {
    rounds: Mutex<Vec<NegotiationRound>>,
    refresh_tx: mpsc::UnboundedSender<Result<Value, ProviderError>>,
    refresh_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Value, ProviderError>>>,
    negotiations: Mutex<Vec<NegotiationConfig>>,
    refreshes: Mutex<Vec<NegotiationConfig>>,
    negotiate_calls: AtomicUsize,
    stop_proxy_calls: AtomicUsize,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                rounds: Mutex::new(Vec::new()),
                refresh_tx,
                refresh_rx: tokio::sync::Mutex::new(refresh_rx),
                negotiations: Mutex::new(Vec::new()),
                refreshes: Mutex::new(Vec::new()),
                negotiate_calls: AtomicUsize::new(0),
                stop_proxy_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Rounds every `negotiate` call will report, in order.
    pub fn with_rounds(self, rounds: Vec<NegotiationRound>) -> Self {
        *self.inner.rounds.lock() = rounds;
        self
    }

    /// Resolve the oldest outstanding (or next) `refresh` call.
    pub fn complete_refresh(&self, result: Result<Value, ProviderError>) {
        let _ = self.inner.refresh_tx.send(result);
    }

    pub fn negotiate_calls(&self) -> usize {
        self.inner.negotiate_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.inner.refreshes.lock().len()
    }

    pub fn stop_proxy_calls(&self) -> usize {
        self.inner.stop_proxy_calls.load(Ordering::SeqCst)
    }

    pub fn last_negotiation(&self) -> Option<NegotiationConfig> {
        self.inner.negotiations.lock().last().cloned()
    }

    pub fn last_refresh(&self) -> Option<NegotiationConfig> {
        self.inner.refreshes.lock().last().cloned()
    }
}

#[async_trait]
impl CredentialProvider for ScriptedProvider {
    fn negotiate(
        &self,
        _credentials: AccountCredentials,
        config: NegotiationConfig,
    ) -> mpsc::UnboundedReceiver<NegotiationRound> {
        self.inner.negotiate_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.negotiations.lock().push(config);
        let (tx, rx) = mpsc::unbounded_channel();
        for round in self.inner.rounds.lock().iter() {
            let round = match round {
                Ok(value) => Ok(value.clone()),
                Err(err) => Err(ProviderError::Negotiation(err.to_string())),
            };
            let _ = tx.send(round);
        }
        rx
    }

    async fn refresh(&self, config: NegotiationConfig) -> Result<Value, ProviderError> {
        self.inner.refreshes.lock().push(config);
        let mut rx = self.inner.refresh_rx.lock().await;
        rx.recv().await.unwrap_or(Err(ProviderError::EmptyResponse))
    }

    async fn stop_proxy(&self) -> Result<(), ProviderError> {
        self.inner.stop_proxy_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
