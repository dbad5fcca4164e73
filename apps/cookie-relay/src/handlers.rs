use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Form, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::{
    auth::{require_basic_auth, AuthGate},
    jobs::{JobOrchestrator, SubmitError, REFRESH_PATH},
    refresh::{LookupError, RefreshError, RefreshOrchestrator},
    render,
    session::{AccountCredentials, CredentialSubmission, TargetSite},
    websocket::{websocket_handler, LiveChannel},
};

#[derive(Clone)]
pub struct AppState {
    pub jobs: JobOrchestrator,
    pub refresh: RefreshOrchestrator,
    pub channel: LiveChannel,
    pub auth: AuthGate,
    pub metrics: Option<PrometheusHandle>,
}

pub fn build_router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/", get(index).post(submit_credentials))
        .route(REFRESH_PATH, get(get_refresh_result).post(post_refresh))
        .route("/ws/:session_id", get(websocket_handler))
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_basic_auth,
        ));

    Router::new()
        .merge(gated)
        .route("/healthz", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Errors surfaced to HTTP callers as plain text.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(&'static str),
    Internal(String),
    NotFound,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
            ApiError::NotFound => StatusCode::NOT_FOUND.into_response(),
        }
    }
}

impl From<RefreshError> for ApiError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::EmptyRegistration => ApiError::BadRequest("Cookie options empty!"),
            RefreshError::Store(e) => {
                error!("failed to issue refresh token: {}", e);
                ApiError::Internal("Unable to schedule cookie refresh".into())
            }
        }
    }
}

impl From<LookupError> for ApiError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::MissingToken => ApiError::BadRequest("Guid empty!"),
            LookupError::Pending => ApiError::Internal(
                "Cookie refresh for specified guid is still in progress, retry later".into(),
            ),
            LookupError::NotFound => ApiError::Internal(
                "No cookie or error for specified guid, maybe timeout of 5 minutes it's expired?"
                    .into(),
            ),
            LookupError::Failed(message) => {
                ApiError::Internal(format!("Error refreshing cookie => ERROR: {message}"))
            }
            LookupError::Store(e) => {
                error!("refresh lookup failed: {}", e);
                ApiError::Internal("Unable to read cookie refresh result".into())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CredentialForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, rename = "amazonSite")]
    pub site: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshQuery {
    pub guid: Option<String>,
}

/// GET / - Credential form
pub async fn index() -> Html<String> {
    Html(render::index_page())
}

/// POST / - Start a sign-in job and return the waiting page
pub async fn submit_credentials(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<CredentialForm>,
) -> Html<String> {
    let caller_host = header_str(&headers, header::HOST).unwrap_or("localhost");
    let submission = CredentialSubmission {
        credentials: AccountCredentials::new(form.username, form.password),
        site: TargetSite::parse(&form.site),
        caller_host: caller_host.to_string(),
        user_agent: header_str(&headers, header::USER_AGENT).map(str::to_string),
    };

    match state.jobs.submit(submission) {
        Ok(started) => Html(render::waiting_page(&started.session_id)),
        Err(SubmitError::MissingCredentials) => {
            debug!("form submitted without credentials");
            Html(render::missing_credentials_page())
        }
    }
}

/// POST /refreshCookie - Issue a token for an asynchronous refresh
pub async fn post_refresh(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<String, ApiError> {
    let registration = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice::<Value>(&body).map_err(|e| {
            warn!("unparseable registration payload: {}", e);
            ApiError::BadRequest("Cookie options empty!")
        })?
    };

    let issued = state.refresh.refresh(registration).await?;
    Ok(issued.token)
}

/// GET /refreshCookie?guid= - Poll for a refresh result
pub async fn get_refresh_result(
    State(state): State<AppState>,
    Query(query): Query<RefreshQuery>,
) -> Result<Json<Value>, ApiError> {
    let token = query.guid.unwrap_or_default();
    let payload = state.refresh.lookup(&token).await?;
    Ok(Json(payload))
}

pub async fn metrics_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let handle = state.metrics.as_ref().ok_or(ApiError::NotFound)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response())
}

/// GET /healthz - Health check endpoint
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
