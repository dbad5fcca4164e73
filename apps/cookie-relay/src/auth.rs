use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;
use tracing::debug;

use crate::config::AppConfig;

const CHALLENGE: &str = "Basic realm=\"cookie-relay\"";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing basic credentials")]
    MissingCredentials,
    #[error("malformed basic credentials")]
    Malformed,
    #[error("invalid username or password")]
    InvalidCredentials,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static(CHALLENGE),
        );
        response
    }
}

/// Optional HTTP basic-auth check in front of every operator route.
///
/// Without a configured username every request passes.
#[derive(Clone, Debug, Default)]
pub struct AuthGate {
    credentials: Option<(String, String)>,
}

impl AuthGate {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        Self {
            credentials: username
                .filter(|u| !u.is_empty())
                .map(|u| (u, password.unwrap_or_default())),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.username.clone(), config.password.clone())
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let Some((username, password)) = &self.credentials else {
            return Ok(());
        };
        let (given_user, given_pass) = extract_basic(headers)?;
        if &given_user == username && &given_pass == password {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }
}

fn extract_basic(headers: &HeaderMap) -> Result<(String, String), AuthError> {
    let encoded = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Basic "))
        .ok_or(AuthError::MissingCredentials)?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::Malformed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;
    // Only the first colon separates; passwords may contain more.
    let (user, pass) = decoded.split_once(':').ok_or(AuthError::Malformed)?;
    Ok((user.to_string(), pass.to_string()))
}

pub async fn require_basic_auth(
    State(gate): State<AuthGate>,
    request: Request,
    next: Next,
) -> Response {
    match gate.check(request.headers()) {
        Ok(()) => next.run(request).await,
        Err(err) => {
            debug!(path = %request.uri().path(), "rejected request: {}", err);
            err.into_response()
        }
    }
}
