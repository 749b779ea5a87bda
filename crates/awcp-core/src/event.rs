// SPDX-License-Identifier: MIT OR Apache-2.0
//! Task-event stream contract.
//!
//! The executor multiplexes these events to SSE subscribers as
//! `data: <json>\n\n` frames. Ordering is guaranteed per assignment: a
//! `snapshot` event, when present, precedes `done`, and exactly one
//! terminal event (`done` or `error`) ends the stream.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::SnapshotMetadata;
use crate::error::ErrorRecord;

/// Coarse task phase reported by `status` events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Transport setup in progress.
    Preparing,
    /// The task executor is running.
    Running,
}

/// One frame of the task-event stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskEvent {
    /// Progress heartbeat. The first `status` observed by the delegator
    /// completes its setup phase.
    #[serde(rename_all = "camelCase")]
    Status {
        /// Current phase.
        status: TaskStatus,
        /// Optional human detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// A point-in-time archive of the executor's changes.
    #[serde(rename_all = "camelCase")]
    Snapshot {
        /// Snapshot identifier, unique within the delegation.
        snapshot_id: String,
        /// Human summary of the captured changes.
        summary: String,
        /// Notable changes, in emphasis order.
        #[serde(default)]
        highlights: Vec<String>,
        /// Base64 archive payload.
        snapshot_base64: String,
        /// Size statistics, when available.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<SnapshotMetadata>,
        /// The executor recommends applying this snapshot.
        #[serde(default)]
        recommended: bool,
    },

    /// Terminal success.
    #[serde(rename_all = "camelCase")]
    Done {
        /// Human summary of what the task did.
        summary: String,
        /// Notable items, in emphasis order.
        #[serde(default)]
        highlights: Vec<String>,
        /// Snapshots emitted during the run.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        snapshot_ids: Vec<String>,
        /// Snapshot the executor recommends applying, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recommended_snapshot_id: Option<String>,
    },

    /// Terminal failure (also used for cancellation, with code
    /// `CANCELLED`).
    Error(ErrorRecord),
}

impl TaskEvent {
    /// Returns `true` for `done` and `error` frames.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error(_))
    }
}
