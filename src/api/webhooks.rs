use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use secrecy::ExposeSecret;

use crate::webhook::{self, WebhookError, WebhookOutcome};

use super::{AppState, error_response};

/// POST /webhooks/github - Pull request and comment deliveries
pub async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    match &state.config.webhook_secret {
        Some(secret) => {
            let signature = headers
                .get("x-hub-signature-256")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if !webhook::validate_signature(secret.expose_secret().as_bytes(), &body, signature) {
                tracing::warn!("Webhook signature validation failed");
                return Err((StatusCode::UNAUTHORIZED, "invalid signature".to_string()));
            }
        }
        None => tracing::warn!("Webhook secret not configured, skipping validation"),
    }

    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    let outcome = webhook::handle_event(&state.service, event_type, &body)
        .await
        .map_err(|e| match e {
            WebhookError::InvalidPayload(_) => {
                tracing::warn!(error = %e, event_type, "Rejected webhook payload");
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            WebhookError::Preview(e) => error_response(e),
        })?;

    match outcome {
        WebhookOutcome::BuildStarted(preview_id) => {
            tracing::info!(preview_id, event_type, "Webhook started a build");
            Ok(StatusCode::ACCEPTED)
        }
        WebhookOutcome::Deleted(preview_id) => {
            tracing::info!(preview_id, event_type, "Webhook deleted a preview");
            Ok(StatusCode::OK)
        }
        WebhookOutcome::Ignored(reason) => {
            tracing::debug!(event_type, reason, "Webhook ignored");
            Ok(StatusCode::OK)
        }
    }
}
