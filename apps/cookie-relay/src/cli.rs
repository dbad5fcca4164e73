use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info};

use crate::jobs::REFRESH_PATH;

#[derive(Parser, Debug)]
#[command(name = "cookie-relay")]
#[command(about = "Cookie relay server and refresh client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// JSON configuration file; missing file means defaults.
    #[arg(long, env = "COOKIE_RELAY_CONFIG", default_value = "config.json")]
    pub config: PathBuf,

    /// Listening port, overriding the configuration file.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Refresh a stored registration through a running relay and print the result
    Refresh {
        /// Relay base URL (e.g., http://localhost:3000)
        #[arg(short, long, default_value = "http://localhost:3000")]
        url: String,

        /// File holding the registration data JSON
        #[arg(short, long)]
        file: PathBuf,

        #[arg(long, env = "COOKIE_RELAY_USERNAME")]
        username: Option<String>,

        #[arg(long, env = "COOKIE_RELAY_PASSWORD")]
        password: Option<String>,

        /// Seconds between polls
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },
}

pub struct RefreshClient {
    client: reqwest::Client,
    endpoint: String,
    credentials: Option<(String, Option<String>)>,
}

impl RefreshClient {
    pub fn new(base_url: &str, username: Option<String>, password: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), REFRESH_PATH),
            credentials: username.map(|u| (u, password)),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some((user, pass)) => request.basic_auth(user, pass.as_ref()),
            None => request,
        }
    }

    pub async fn issue(&self, registration: &Value) -> Result<String> {
        let response = self
            .authorize(self.client.post(&self.endpoint))
            .json(registration)
            .send()
            .await
            .context("refresh request failed")?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            bail!("relay rejected refresh ({}): {}", status, body);
        }
        Ok(body.trim().to_string())
    }

    /// One poll: `Ok(None)` while the result is not available yet.
    pub async fn poll(&self, token: &str) -> Result<Option<Value>> {
        let response = self
            .authorize(self.client.get(&self.endpoint))
            .query(&[("guid", token)])
            .send()
            .await
            .context("poll request failed")?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await?)),
            StatusCode::INTERNAL_SERVER_ERROR => {
                let body = response.text().await?;
                // Anything else (failure, expired or unknown token) is final.
                if body.contains("still in progress") {
                    debug!("result not ready: {}", body);
                    Ok(None)
                } else {
                    Err(anyhow!(body))
                }
            }
            status => bail!("unexpected status {}: {}", status, response.text().await?),
        }
    }
}

pub async fn run_refresh_client(
    url: String,
    file: PathBuf,
    username: Option<String>,
    password: Option<String>,
    interval: Duration,
    timeout: Duration,
) -> Result<Value> {
    let raw = tokio::fs::read(&file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let registration: Value = serde_json::from_slice(&raw)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;

    let client = RefreshClient::new(&url, username, password);
    let token = client.issue(&registration).await?;
    info!(%token, "refresh scheduled");
    eprintln!("token: {}", token);

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(result) = client.poll(&token).await? {
            return Ok(result);
        }
        if Instant::now() + interval > deadline {
            bail!("timed out waiting for refresh result");
        }
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parses_refresh_subcommand() {
        let cli = Cli::parse_from([
            "cookie-relay",
            "refresh",
            "--url",
            "http://relay:3000",
            "--file",
            "reg.json",
            "--interval-secs",
            "1",
        ]);
        match cli.command {
            Some(Commands::Refresh {
                url,
                file,
                interval_secs,
                timeout_secs,
                ..
            }) => {
                assert_eq!(url, "http://relay:3000");
                assert_eq!(file, PathBuf::from("reg.json"));
                assert_eq!(interval_secs, 1);
                assert_eq!(timeout_secs, 120);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn poll_only_waits_while_in_progress() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/refreshCookie"))
            .and(query_param("guid", "waiting"))
            .respond_with(ResponseTemplate::new(500).set_body_string(
                "Cookie refresh for specified guid is still in progress, retry later",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/refreshCookie"))
            .and(query_param("guid", "failed"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_string("Error refreshing cookie => ERROR: expired"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/refreshCookie"))
            .and(query_param("guid", "expired"))
            .respond_with(ResponseTemplate::new(500).set_body_string(
                "No cookie or error for specified guid, maybe timeout of 5 minutes it's expired?",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/refreshCookie"))
            .and(query_param("guid", "done"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"csrf": "x"})))
            .mount(&server)
            .await;

        let client = RefreshClient::new(&server.uri(), None, None);
        assert_eq!(client.poll("waiting").await.unwrap(), None);
        assert!(client.poll("failed").await.is_err());
        let err = client.poll("expired").await.unwrap_err();
        assert!(err.to_string().starts_with("No cookie or error"));
        assert_eq!(
            client.poll("done").await.unwrap(),
            Some(json!({"csrf": "x"}))
        );
    }

    #[tokio::test]
    async fn issue_returns_trimmed_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/refreshCookie"))
            .respond_with(ResponseTemplate::new(200).set_body_string("abc-123\n"))
            .mount(&server)
            .await;

        let client = RefreshClient::new(&server.uri(), Some("u".into()), Some("p".into()));
        assert_eq!(client.issue(&json!({"a": "b"})).await.unwrap(), "abc-123");
    }
}
