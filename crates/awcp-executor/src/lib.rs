// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Executor daemon: the AWCP endpoint plus the task-event SSE stream.
//!
//! `POST /awcp` accepts INVITE / START / ERROR. INVITE is answered in
//! the response body (ACCEPT or ERROR); START and ERROR get an empty
//! 2xx. Task events stream from `GET /awcp/tasks/:id/events` as
//! `data: <json>\n\n` frames; the archive transport's chunk endpoints
//! feed the shared chunk store.

/// Acceptance policy for incoming INVITEs.
pub mod admission;
/// Write-through JSON persistence for assignment records.
pub mod assignments;
/// Cancellation primitives.
pub mod cancel;
/// Per-assignment event channels.
pub mod channel;
/// The assignment protocol engine.
pub mod service;
/// Periodic cleanup sweep.
pub mod sweep;
/// The user task executor seam.
pub mod task;
/// Work-path lifecycle.
pub mod workspace;

use axum::{
    Json, Router,
    extract::{Path as AxPath, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use uuid::Uuid;

use awcp_core::PROTOCOL_VERSION;
use awcp_core::error::{ErrorCode, ErrorRecord};
use awcp_core::event::TaskEvent;
use awcp_core::message::{ControlBody, ControlMessage};

use crate::service::{ExecutorService, SubscribeOutcome};

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    /// The assignment service.
    pub service: std::sync::Arc<ExecutorService>,
}

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

/// Request body for `POST /awcp/chunks/:id/:index`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUpload {
    /// Hex SHA-256 of this chunk.
    pub sha256: String,
    /// Base64 chunk payload.
    pub data_base64: String,
}

/// Request body for `POST /awcp/chunks/:id/complete`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkComplete {
    /// Hex SHA-256 of the assembled archive.
    pub total_sha256: String,
}

/// Response body for `GET /awcp/chunks/:id/status`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkStatusResponse {
    /// Chunks received so far.
    pub received: u32,
    /// The completion call has arrived.
    pub completed: bool,
}

/// HTTP error with a protocol error record body.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status to answer with.
    pub status: StatusCode,
    /// Protocol-visible error record.
    pub record: ErrorRecord,
}

impl ApiError {
    /// 404 with a `NOT_FOUND` record.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            record: ErrorRecord::new(ErrorCode::NotFound, message),
        }
    }

    /// 400 with a `TRANSPORT_ERROR` record.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            record: ErrorRecord::new(ErrorCode::TransportError, message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.record.message,
            "code": self.record.code,
            "hint": self.record.hint,
        }));
        (self.status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the Axum router with all executor routes.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(cmd_health))
        .route("/awcp", post(cmd_control))
        .route("/awcp/tasks/{id}/events", get(cmd_events))
        .route("/awcp/tasks/{id}/ack", post(cmd_ack))
        .route("/awcp/cancel/{id}", post(cmd_cancel))
        .route("/awcp/chunks/{id}/complete", post(cmd_chunk_complete))
        .route("/awcp/chunks/{id}/status", get(cmd_chunk_status))
        .route("/awcp/chunks/{id}/{index}", post(cmd_chunk_upload))
        .with_state(state)
}

async fn cmd_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "protocolVersion": PROTOCOL_VERSION,
    }))
}

/// INVITE answers in the body; START/ERROR answer 202.
async fn cmd_control(
    State(state): State<AppState>,
    Json(message): Json<ControlMessage>,
) -> Response {
    let id = message.delegation_id;
    let is_invite = matches!(message.body, ControlBody::Invite(_));

    match state.service.handle_message(message).await {
        Ok(Some(reply)) => Json(reply).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(record) if is_invite => {
            // Refusals ride back as an ERROR control message.
            Json(ControlMessage::new(id, ControlBody::Error(record))).into_response()
        }
        Err(record) => {
            let status = if record.code == ErrorCode::NotFound {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::CONFLICT
            };
            ApiError { status, record }.into_response()
        }
    }
}

enum EventSource {
    Ended,
    One(Box<TaskEvent>),
    Live(tokio::sync::broadcast::Receiver<TaskEvent>),
}

fn frame(event: &TaskEvent) -> SseEvent {
    SseEvent::default().data(serde_json::to_string(event).unwrap_or_else(|_| "{}".into()))
}

fn event_stream(source: EventSource) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    futures::stream::unfold(source, |source| async move {
        match source {
            EventSource::Ended => None,
            EventSource::One(event) => Some((Ok(frame(&event)), EventSource::Ended)),
            EventSource::Live(mut rx) => loop {
                match rx.recv().await {
                    Ok(event) if event.is_terminal() => {
                        break Some((Ok(frame(&event)), EventSource::Ended));
                    }
                    Ok(event) => break Some((Ok(frame(&event)), EventSource::Live(rx))),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break None,
                }
            },
        }
    })
}

async fn cmd_events(
    State(state): State<AppState>,
    AxPath(id): AxPath<Uuid>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let source = match state.service.subscribe(id).await {
        SubscribeOutcome::NotFound(event) | SubscribeOutcome::Replay(event) => {
            EventSource::One(Box::new(event))
        }
        SubscribeOutcome::Live(rx) => EventSource::Live(rx),
    };
    Sse::new(event_stream(source))
}

async fn cmd_ack(
    State(state): State<AppState>,
    AxPath(id): AxPath<Uuid>,
) -> impl IntoResponse {
    state.service.acknowledge(id).await;
    Json(json!({ "ok": true }))
}

async fn cmd_cancel(
    State(state): State<AppState>,
    AxPath(id): AxPath<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.service.cancel(id).await {
        Ok(Json(json!({ "ok": true })))
    } else {
        Err(ApiError::not_found(format!("unknown delegation {id}")))
    }
}

async fn cmd_chunk_upload(
    State(state): State<AppState>,
    AxPath((id, index)): AxPath<(Uuid, u32)>,
    Json(upload): Json<ChunkUpload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let bytes = BASE64
        .decode(&upload.data_base64)
        .map_err(|e| ApiError::bad_request(format!("chunk decode failed: {e}")))?;
    state
        .service
        .chunk_store()
        .put(id, index, bytes, &upload.sha256)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(json!({ "ok": true })))
}

async fn cmd_chunk_complete(
    State(state): State<AppState>,
    AxPath(id): AxPath<Uuid>,
    Json(complete): Json<ChunkComplete>,
) -> impl IntoResponse {
    state.service.chunk_store().complete(id, &complete.total_sha256);
    Json(json!({ "ok": true }))
}

async fn cmd_chunk_status(
    State(state): State<AppState>,
    AxPath(id): AxPath<Uuid>,
) -> Result<Json<ChunkStatusResponse>, ApiError> {
    state
        .service
        .chunk_store()
        .status(id)
        .map(|status| {
            Json(ChunkStatusResponse {
                received: status.received,
                completed: status.completed,
            })
        })
        .ok_or_else(|| ApiError::not_found(format!("no chunk transfer for {id}")))
}
