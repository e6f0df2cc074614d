pub mod previews;
pub mod types;
pub mod webhooks;

use std::collections::HashMap;
use std::future::ready;
use std::sync::Arc;

use axum::{
    Router,
    http::{StatusCode, request::Parts},
    routing::{get, post},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use crate::config::Config;
use crate::docker_client::DockerClient;
use crate::error::PreviewError;
use crate::events::BroadcastPublisher;
use crate::lifecycle::{Actor, PreviewService};

#[derive(Clone)]
pub struct AppState {
    pub service: PreviewService,
    pub publisher: Arc<BroadcastPublisher>,
    pub docker_client: Option<DockerClient>,
    pub config: Arc<Config>,
    /// API token -> user id.
    pub tokens: Arc<HashMap<String, String>>,
}

/// Create router for all endpoints
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhooks/github", post(webhooks::github_webhook))
        .merge(preview_routes())
        .with_state(state)
}

pub fn preview_routes() -> Router<AppState> {
    Router::new()
        .route("/previews", get(previews::list_previews))
        .route(
            "/previews/{id}",
            get(previews::get_preview_detail).delete(previews::delete_preview),
        )
        .route("/previews/{id}/rebuild", post(previews::rebuild_preview))
        .route("/previews/{id}/events", get(previews::stream_preview_events))
        .route("/previews/{id}/logs", get(previews::stream_preview_container_logs))
}

async fn healthz() -> &'static str {
    "ok"
}

pub(crate) fn error_response(err: PreviewError) -> (StatusCode, String) {
    let status = match &err {
        PreviewError::Forbidden => StatusCode::FORBIDDEN,
        PreviewError::NotFound(_) => StatusCode::NOT_FOUND,
        PreviewError::BuildInProgress(_) | PreviewError::PreviewDeleted(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "Request failed");
    }
    (status, err.to_string())
}

/// Pulls the API key from `x-api-key`, falling back to the Basic auth password.
fn api_key(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| {
            parts
                .headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|auth| {
                    let auth = auth.trim();
                    let b64 = auth
                        .strip_prefix("Basic ")
                        .or_else(|| auth.strip_prefix("basic "))?;
                    let decoded = BASE64.decode(b64.as_bytes()).ok()?;
                    let creds = String::from_utf8(decoded).ok()?; // username:password
                    let (_username, password) = creds.split_once(':')?;
                    if password.is_empty() {
                        None
                    } else {
                        Some(password.to_string())
                    }
                })
        })
}

/// The authenticated user behind a request.
pub struct CurrentUser(pub Actor);

impl axum::extract::FromRequestParts<AppState> for CurrentUser {
    type Rejection = (StatusCode, String);

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let res = match api_key(parts) {
            None => Err((
                StatusCode::UNAUTHORIZED,
                "missing x-api-key or Basic auth password".to_string(),
            )),
            Some(key) => state
                .tokens
                .get(&key)
                .map(|user| CurrentUser(Actor::User(user.clone())))
                .ok_or((StatusCode::UNAUTHORIZED, "unknown API key".to_string())),
        };
        ready(res)
    }
}
