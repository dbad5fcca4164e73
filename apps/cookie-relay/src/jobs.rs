//! Live sign-in jobs started from the operator form.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::provider::{has_security_token, CredentialProvider, NegotiationConfig};
use crate::render;
use crate::session::{generate_live_session_id, CredentialSubmission};
use crate::websocket::LiveChannel;

/// Path the automation consumer polls for refreshed sessions.
pub const REFRESH_PATH: &str = "/refreshCookie";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("username and password are required")]
    MissingCredentials,
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Grace period so the waiting page can open its live channel first.
    pub start_delay: Duration,
    pub proxy_port: u16,
    pub verbose: bool,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_secs(2),
            proxy_port: 0,
            verbose: false,
        }
    }
}

/// A job that has been scheduled; the handle is only awaited by tests.
pub struct StartedJob {
    pub session_id: String,
    pub handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct JobOrchestrator {
    provider: Arc<dyn CredentialProvider>,
    channel: LiveChannel,
    settings: JobSettings,
}

impl JobOrchestrator {
    pub fn new(
        provider: Arc<dyn CredentialProvider>,
        channel: LiveChannel,
        settings: JobSettings,
    ) -> Self {
        Self {
            provider,
            channel,
            settings,
        }
    }

    /// Validate the submission and schedule the handshake in the background.
    ///
    /// Results are pushed to the live session returned in [`StartedJob`].
    pub fn submit(&self, submission: CredentialSubmission) -> Result<StartedJob, SubmitError> {
        if !submission.credentials.is_complete() {
            counter!("cookie_relay_jobs_rejected_total").increment(1);
            return Err(SubmitError::MissingCredentials);
        }

        let session_id = generate_live_session_id();
        info!(
            session = %session_id,
            site = %submission.site.host,
            account = %submission.credentials.account_id,
            "scheduling sign-in job"
        );
        counter!("cookie_relay_jobs_started_total").increment(1);

        let job = self.clone();
        let job_session = session_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(job.settings.start_delay).await;
            job.run(job_session, submission).await;
        });

        Ok(StartedJob { session_id, handle })
    }

    fn negotiation_config(&self, submission: &CredentialSubmission) -> NegotiationConfig {
        NegotiationConfig {
            target_site: submission.site.host.clone(),
            accept_language: submission.site.locale.clone(),
            user_agent: submission.user_agent.clone(),
            proxy_only: true,
            setup_proxy: true,
            proxy_own_host: submission.caller_hostname().to_string(),
            proxy_port: self.settings.proxy_port,
            proxy_listen_bind: String::new(),
            proxy_log_level: "warn".to_string(),
            proxy_page_language: submission.site.locale.clone(),
            verbose: self.settings.verbose,
            former_registration_data: None,
        }
    }

    async fn run(&self, session_id: String, submission: CredentialSubmission) {
        let config = self.negotiation_config(&submission);
        let refresh_url = format!("http://{}{}", submission.caller_host, REFRESH_PATH);
        let mut rounds = self
            .provider
            .negotiate(submission.credentials.clone(), config);

        while let Some(round) = rounds.recv().await {
            match round {
                Err(err) => {
                    // Not terminal: the operator may still finish signing in via the proxy.
                    warn!(session = %session_id, "negotiation round failed: {}", err);
                    counter!("cookie_relay_negotiation_rounds_total", "kind" => "error").increment(1);
                    self.channel
                        .publish(&session_id, render::negotiation_error(&err.to_string()));
                }
                Ok(result) if has_security_token(&result) => {
                    counter!("cookie_relay_negotiation_rounds_total", "kind" => "success").increment(1);
                    if let Err(err) = self.provider.stop_proxy().await {
                        warn!(session = %session_id, "failed to stop sign-in proxy: {}", err);
                    }
                    let delivered = self.channel.publish(
                        &session_id,
                        render::negotiation_success(&refresh_url, &result),
                    );
                    info!(session = %session_id, delivered, "sign-in job completed");
                    return;
                }
                Ok(_) => {
                    counter!("cookie_relay_negotiation_rounds_total", "kind" => "incomplete").increment(1);
                    debug!(session = %session_id, "round without security token ignored");
                }
            }
        }
        debug!(session = %session_id, "provider closed without session material");
    }
}
