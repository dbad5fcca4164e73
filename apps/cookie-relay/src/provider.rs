//! Interface to the external credential provider.
//!
//! The provider owns the sign-in handshake with the remote identity service,
//! including the temporary proxy it may open for the operator. This crate only
//! starts jobs, relays their rounds and asks for the proxy to be torn down.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::session::AccountCredentials;

/// Field whose presence marks a result as usable session material.
pub const SECURITY_TOKEN_FIELD: &str = "csrf";

pub fn has_security_token(result: &Value) -> bool {
    result
        .get(SECURITY_TOKEN_FIELD)
        .is_some_and(|value| !value.is_null())
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Reported by the provider itself; the text is meant for the operator.
    #[error("{0}")]
    Negotiation(String),
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider responded with status {0}")]
    Status(StatusCode),
    #[error("invalid provider frame: {0}")]
    Frame(#[from] serde_json::Error),
    #[error("provider closed the response without a result")]
    EmptyResponse,
}

/// Options handed to the provider for one job.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationConfig {
    pub target_site: String,
    pub accept_language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub proxy_only: bool,
    pub setup_proxy: bool,
    pub proxy_own_host: String,
    /// 0 lets the provider pick a free port.
    pub proxy_port: u16,
    /// Empty binds every interface.
    pub proxy_listen_bind: String,
    pub proxy_log_level: String,
    pub proxy_page_language: String,
    /// Whether the provider should stream its own logs.
    pub verbose: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub former_registration_data: Option<Value>,
}

impl NegotiationConfig {
    pub fn for_refresh(registration: Value, verbose: bool) -> Self {
        Self {
            verbose,
            former_registration_data: Some(registration),
            ..Self::default()
        }
    }
}

/// One handshake round as reported by the provider.
pub type NegotiationRound = Result<Value, ProviderError>;

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Start a handshake. Each round arrives on the receiver, intermediate
    /// errors included; the channel closes once the provider is done.
    fn negotiate(
        &self,
        credentials: AccountCredentials,
        config: NegotiationConfig,
    ) -> mpsc::UnboundedReceiver<NegotiationRound>;

    /// Renew a session from registration data captured by an earlier handshake.
    async fn refresh(&self, config: NegotiationConfig) -> Result<Value, ProviderError>;

    /// Tear down the sign-in proxy opened by `negotiate`, if any.
    async fn stop_proxy(&self) -> Result<(), ProviderError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProviderFrame {
    Error { error: String },
    Result { result: Value },
}

impl ProviderFrame {
    fn into_round(self) -> NegotiationRound {
        match self {
            ProviderFrame::Error { error } => Err(ProviderError::Negotiation(error)),
            ProviderFrame::Result { result } => Ok(result),
        }
    }
}

#[derive(Serialize)]
struct NegotiateRequest<'a> {
    account: &'a str,
    secret: &'a str,
    options: &'a NegotiationConfig,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    options: &'a NegotiationConfig,
}

/// Talks to a provider sidecar over HTTP.
///
/// `POST /negotiate` answers with newline-delimited JSON frames, one per round;
/// `POST /refresh` answers with a single frame.
#[derive(Clone)]
pub struct HttpCredentialProvider {
    client: Client,
    base_url: String,
}

impl HttpCredentialProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn stream_rounds(
        &self,
        credentials: AccountCredentials,
        config: NegotiationConfig,
        tx: &mpsc::UnboundedSender<NegotiationRound>,
    ) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(self.url("/negotiate"))
            .json(&NegotiateRequest {
                account: &credentials.account_id,
                secret: &credentials.secret,
                options: &config,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status()));
        }

        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if forward_frame(&line, tx).is_err() {
                    // Receiver dropped; nobody is listening any more.
                    return Ok(());
                }
            }
        }
        let _ = forward_frame(&buffer, tx);
        Ok(())
    }
}

fn forward_frame(
    line: &[u8],
    tx: &mpsc::UnboundedSender<NegotiationRound>,
) -> Result<(), mpsc::error::SendError<NegotiationRound>> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Ok(());
    }
    let round = match serde_json::from_slice::<ProviderFrame>(trimmed) {
        Ok(frame) => frame.into_round(),
        Err(err) => Err(ProviderError::Frame(err)),
    };
    tx.send(round)
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    fn negotiate(
        &self,
        credentials: AccountCredentials,
        config: NegotiationConfig,
    ) -> mpsc::UnboundedReceiver<NegotiationRound> {
        let (tx, rx) = mpsc::unbounded_channel();
        let provider = self.clone();
        tokio::spawn(async move {
            if let Err(err) = provider.stream_rounds(credentials, config, &tx).await {
                warn!(error = %err, "negotiation stream ended with error");
                let _ = tx.send(Err(err));
            }
            debug!("negotiation stream closed");
        });
        rx
    }

    async fn refresh(&self, config: NegotiationConfig) -> Result<Value, ProviderError> {
        let response = self
            .client
            .post(self.url("/refresh"))
            .json(&RefreshRequest { options: &config })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status()));
        }
        let bytes = response.bytes().await?;
        if bytes.trim_ascii().is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        let frame: ProviderFrame = serde_json::from_slice(&bytes)?;
        frame.into_round()
    }

    async fn stop_proxy(&self) -> Result<(), ProviderError> {
        let response = self.client.post(self.url("/proxy/stop")).send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status()));
        }
        Ok(())
    }
}
