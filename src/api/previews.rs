use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::events::PreviewEvent;
use crate::models::PreviewId;

use super::types::*;
use super::{AppState, CurrentUser, error_response};

fn event_name(event: &PreviewEvent) -> &'static str {
    match event {
        PreviewEvent::StateUpdate { .. } => "stateUpdate",
        PreviewEvent::LogChunk { .. } => "logChunk",
    }
}

fn sse_event(event: &PreviewEvent) -> Result<Event, axum::Error> {
    Event::default().event(event_name(event)).json_data(event)
}

/// GET /previews?projectId= - List a project's previews
pub async fn list_previews(
    CurrentUser(actor): CurrentUser,
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<PreviewListResponse>, (StatusCode, String)> {
    let previews = state
        .service
        .list_previews(params.project_id, &actor)
        .await
        .map_err(error_response)?;

    Ok(Json(PreviewListResponse {
        previews: previews.iter().map(PreviewSummary::from).collect(),
    }))
}

/// GET /previews/{id} - Preview detail including the latest build log
pub async fn get_preview_detail(
    CurrentUser(actor): CurrentUser,
    State(state): State<AppState>,
    Path(id): Path<PreviewId>,
) -> Result<Json<PreviewDetailResponse>, (StatusCode, String)> {
    let preview = state
        .service
        .get_preview(id, &actor)
        .await
        .map_err(error_response)?;
    Ok(Json(preview.into()))
}

/// POST /previews/{id}/rebuild - Start a new build attempt
///
/// Responds as soon as the attempt is recorded; the outcome arrives on the
/// event stream.
pub async fn rebuild_preview(
    CurrentUser(actor): CurrentUser,
    State(state): State<AppState>,
    Path(id): Path<PreviewId>,
) -> Result<(StatusCode, Json<PreviewSummary>), (StatusCode, String)> {
    let ticket = state
        .service
        .rebuild(id, &actor)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(PreviewSummary::from(ticket.preview()))))
}

/// DELETE /previews/{id} - Tear the preview down
pub async fn delete_preview(
    CurrentUser(actor): CurrentUser,
    State(state): State<AppState>,
    Path(id): Path<PreviewId>,
) -> Result<Json<PreviewSummary>, (StatusCode, String)> {
    let preview = state
        .service
        .delete_preview(id, &actor)
        .await
        .map_err(error_response)?;
    Ok(Json(PreviewSummary::from(&preview)))
}

/// GET /previews/{id}/events - Stream build output and state changes via SSE
///
/// The first event is the preview's current state.
pub async fn stream_preview_events(
    CurrentUser(actor): CurrentUser,
    State(state): State<AppState>,
    Path(id): Path<PreviewId>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, (StatusCode, String)> {
    // Check access before opening a channel for the id.
    state
        .service
        .get_preview(id, &actor)
        .await
        .map_err(error_response)?;
    let receiver = state.publisher.subscribe_preview(id).map_err(|e| {
        tracing::error!(error = %e, preview_id = id, "Failed to subscribe to preview events");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    // Re-read after subscribing so no transition falls in between.
    let preview = state
        .service
        .get_preview(id, &actor)
        .await
        .map_err(error_response)?;

    tracing::info!(preview_id = id, "Streaming preview events");
    let initial = tokio_stream::once(sse_event(&PreviewEvent::state(&preview)));
    let updates = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(event) => sse_event(&event),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            Ok(Event::default().comment(format!("skipped {} events", skipped)))
        }
    });

    Ok(Sse::new(initial.chain(updates)).keep_alive(KeepAlive::default()))
}

/// GET /previews/{id}/logs - Stream the running container's logs via SSE
pub async fn stream_preview_container_logs(
    CurrentUser(actor): CurrentUser,
    State(state): State<AppState>,
    Path(id): Path<PreviewId>,
    Query(params): Query<LogParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, String>>>, (StatusCode, String)> {
    let docker_client = state.docker_client.as_ref().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "Docker client not available".to_string(),
        )
    })?;

    let preview = state
        .service
        .get_preview(id, &actor)
        .await
        .map_err(error_response)?;
    let container_name = preview.container_name.ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            format!("Preview {} has no container", id),
        )
    })?;

    tracing::info!(
        preview_id = id,
        container_name,
        tail = params.tail,
        follow = params.follow,
        "Streaming container logs"
    );

    let receiver = docker_client
        .stream_logs(&container_name, params.tail as u64, params.follow)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, container_name, "Failed to stream logs");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to stream logs: {}", e),
            )
        })?;

    let stream = ReceiverStream::new(receiver).map(|line_result| {
        line_result
            .map(|line| Event::default().data(line))
            .map_err(|err| err.to_string())
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
