// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Delegator daemon: local HTTP API over the delegation service.
//!
//! The REST surface is thin — every route delegates to
//! [`DelegatorService`] and maps its typed errors onto HTTP statuses
//! with `{ error, code, hint }` bodies.

/// Preflight admission scan for resource trees.
pub mod admission;
/// HTTP client for the executor daemon.
pub mod client;
/// Environment materialization.
pub mod environment;
/// Write-through JSON persistence for delegation records.
pub mod persist;
/// The delegation protocol engine.
pub mod service;
/// Staged snapshot persistence.
pub mod snapshots;
/// Periodic cleanup sweep.
pub mod sweep;

use axum::{
    Json, Router,
    extract::{Path as AxPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use awcp_core::error::{ErrorCode, ErrorRecord};
use awcp_core::handle::TransportKind;
use awcp_core::message::AuthClaim;
use awcp_core::state::DelegationState;
use awcp_core::{
    AccessMode, Delegation, EnvironmentSnapshot, PROTOCOL_VERSION, ResourceKind, ResourceSpec,
    SnapshotPolicy, TaskSpec,
};

use crate::service::{DelegateError, DelegateParams, DelegatorService, SnapshotOpError};

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    /// The delegation service.
    pub service: Arc<DelegatorService>,
}

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

/// One resource in a delegate request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInput {
    /// Name the resource is materialized under.
    pub name: String,
    /// Resource kind (only directories today).
    #[serde(rename = "type", default = "default_kind")]
    pub kind: ResourceKind,
    /// Local source path.
    pub source: PathBuf,
    /// Per-resource access mode; falls back to the request-level mode.
    #[serde(default)]
    pub mode: Option<AccessMode>,
}

fn default_kind() -> ResourceKind {
    ResourceKind::Directory
}

/// The environment section of a delegate request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInput {
    /// Offered resources.
    pub resources: Vec<ResourceInput>,
}

/// Request body for `POST /delegate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateRequest {
    /// Base URL of the executor daemon.
    pub executor_url: String,
    /// Offered environment.
    pub environment: EnvironmentInput,
    /// Task descriptor.
    pub task: TaskSpec,
    /// Lease TTL override, in seconds.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    /// Access mode override.
    #[serde(default)]
    pub access_mode: Option<AccessMode>,
    /// Snapshot policy override.
    #[serde(default)]
    pub snapshot_mode: Option<SnapshotPolicy>,
    /// Transport override.
    #[serde(default)]
    pub transport: Option<TransportKind>,
    /// Credential claim forwarded in INVITE.
    #[serde(default)]
    pub auth: Option<AuthClaim>,
}

/// Response body for `POST /delegate`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateResponse {
    /// Identifier of the new delegation.
    pub delegation_id: Uuid,
}

/// One row of `GET /delegations`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationSummary {
    /// Delegation identifier.
    pub id: Uuid,
    /// Current state.
    pub state: DelegationState,
    /// Executor base URL.
    pub peer_url: String,
    /// Task description.
    pub description: String,
    /// Creation instant.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Last mutation instant.
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Delegation> for DelegationSummary {
    fn from(d: &Delegation) -> Self {
        Self {
            id: d.id,
            state: d.state,
            peer_url: d.peer_url.clone(),
            description: d.task.description.clone(),
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

/// Response body for `GET /delegations`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationsResponse {
    /// Number of non-terminal delegations.
    pub active_delegations: usize,
    /// All tracked delegations, oldest first.
    pub delegations: Vec<DelegationSummary>,
}

/// Response body for `GET /delegation/:id/snapshots`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotsResponse {
    /// Snapshots in arrival order.
    pub snapshots: Vec<EnvironmentSnapshot>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

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
            record: ErrorRecord::new(ErrorCode::NotFound, message)
                .with_hint("check the id against GET /delegations"),
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

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::WorkspaceNotFound
        | ErrorCode::WorkspaceInvalid
        | ErrorCode::WorkspaceTooLarge
        | ErrorCode::SensitiveFiles => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Declined
        | ErrorCode::DependencyMissing
        | ErrorCode::WorkdirDenied
        | ErrorCode::TransportError
        | ErrorCode::SseFailed
        | ErrorCode::ChecksumMismatch => StatusCode::BAD_GATEWAY,
        ErrorCode::TaskFailed | ErrorCode::Cancelled => StatusCode::CONFLICT,
    }
}

impl From<DelegateError> for ApiError {
    fn from(err: DelegateError) -> Self {
        match err {
            DelegateError::Protocol(record) => Self {
                status: status_for(record.code),
                record,
            },
            DelegateError::Internal(err) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                record: ErrorRecord::new(ErrorCode::TransportError, err.to_string()),
            },
        }
    }
}

impl From<SnapshotOpError> for ApiError {
    fn from(err: SnapshotOpError) -> Self {
        match err {
            SnapshotOpError::UnknownDelegation => Self::not_found("delegation not found"),
            SnapshotOpError::UnknownSnapshot => Self::not_found("snapshot not found"),
            SnapshotOpError::Conflict(message) => Self {
                status: StatusCode::CONFLICT,
                record: ErrorRecord::new(ErrorCode::TransportError, message),
            },
            SnapshotOpError::Transport(record) => Self {
                status: StatusCode::BAD_GATEWAY,
                record,
            },
            SnapshotOpError::Internal(err) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                record: ErrorRecord::new(ErrorCode::TransportError, err.to_string()),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the Axum router with all delegator routes.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(cmd_health))
        .route("/delegate", post(cmd_delegate))
        .route("/delegations", get(cmd_list))
        .route("/delegation/{id}", get(cmd_get))
        .route("/delegation/{id}", delete(cmd_cancel))
        .route("/delegation/{id}/snapshots", get(cmd_snapshots))
        .route(
            "/delegation/{id}/snapshots/{snapshot_id}/apply",
            post(cmd_apply_snapshot),
        )
        .route(
            "/delegation/{id}/snapshots/{snapshot_id}/discard",
            post(cmd_discard_snapshot),
        )
        .with_state(state)
}

async fn cmd_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "protocolVersion": PROTOCOL_VERSION,
    }))
}

async fn cmd_delegate(
    State(state): State<AppState>,
    Json(req): Json<DelegateRequest>,
) -> Result<Json<DelegateResponse>, ApiError> {
    let default_mode = req.access_mode.unwrap_or(AccessMode::Ro);
    let resources = req
        .environment
        .resources
        .into_iter()
        .map(|r| ResourceSpec {
            name: r.name,
            kind: r.kind,
            source: r.source,
            mode: r.mode.unwrap_or(default_mode),
        })
        .collect();

    let delegation_id = state
        .service
        .delegate(DelegateParams {
            executor_url: req.executor_url,
            task: req.task,
            resources,
            ttl_seconds: req.ttl_seconds,
            access_mode: req.access_mode,
            snapshot_policy: req.snapshot_mode,
            transport: req.transport,
            auth: req.auth,
        })
        .await?;

    Ok(Json(DelegateResponse { delegation_id }))
}

async fn cmd_list(State(state): State<AppState>) -> impl IntoResponse {
    let records = state.service.list().await;
    let active_delegations = records.iter().filter(|d| !d.is_terminal()).count();
    Json(DelegationsResponse {
        active_delegations,
        delegations: records.iter().map(DelegationSummary::from).collect(),
    })
}

async fn cmd_get(
    State(state): State<AppState>,
    AxPath(id): AxPath<Uuid>,
) -> Result<Json<Delegation>, ApiError> {
    state
        .service
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("delegation {id} not found")))
}

async fn cmd_cancel(
    State(state): State<AppState>,
    AxPath(id): AxPath<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.service.cancel(id).await {
        Ok(Json(json!({ "ok": true })))
    } else {
        Err(ApiError::not_found(format!("delegation {id} not found")))
    }
}

async fn cmd_snapshots(
    State(state): State<AppState>,
    AxPath(id): AxPath<Uuid>,
) -> Result<Json<SnapshotsResponse>, ApiError> {
    let delegation = state
        .service
        .get(id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("delegation {id} not found")))?;
    Ok(Json(SnapshotsResponse {
        snapshots: delegation.snapshots,
    }))
}

async fn cmd_apply_snapshot(
    State(state): State<AppState>,
    AxPath((id, snapshot_id)): AxPath<(Uuid, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.service.apply_snapshot(id, &snapshot_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn cmd_discard_snapshot(
    State(state): State<AppState>,
    AxPath((id, snapshot_id)): AxPath<(Uuid, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.service.discard_snapshot(id, &snapshot_id).await?;
    Ok(Json(json!({ "ok": true })))
}
