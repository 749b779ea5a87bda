// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! awcp-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for AWCP workspace delegation.
//!
//! Everything in this crate is wire- or disk-visible: control messages,
//! task events, transport handles, lifecycle states, and the persisted
//! delegation / assignment records built from them.

/// Protocol error taxonomy and the `ErrorRecord` wire shape.
pub mod error;
/// Task-event stream contract (status / snapshot / done / error).
pub mod event;
/// Transport handle sum type and capability flags.
pub mod handle;
/// Control-plane message envelopes (INVITE / ACCEPT / START / ERROR).
pub mod message;
/// Delegation and assignment lifecycle state machines.
pub mod state;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::ErrorRecord;
use crate::handle::TransportKind;
use crate::message::InviteBody;
use crate::state::{
    AssignmentEvent, AssignmentState, DelegationEvent, DelegationState, StateError, assignment_next,
    delegation_next,
};

/// Protocol version string carried in every control message.
///
/// # Examples
///
/// ```
/// assert_eq!(awcp_core::PROTOCOL_VERSION, "1");
/// ```
pub const PROTOCOL_VERSION: &str = "1";

/// Generate a fresh delegation identifier.
#[must_use]
pub fn new_delegation_id() -> Uuid {
    Uuid::new_v4()
}

/// Generate a fresh snapshot identifier (`snap_<hex>`).
#[must_use]
pub fn new_snapshot_id() -> String {
    format!("snap_{}", Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Resources and environments
// ---------------------------------------------------------------------------

/// Access granted to the executor for a resource.
///
/// Ordering matters: `Ro < Rw`, so an executor's accepted mode can be
/// clamped with [`AccessMode::min`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Read-only view; changes never flow back.
    Ro,
    /// Read-write view; changes flow back via snapshots or live sync.
    Rw,
}

impl AccessMode {
    /// The more restrictive of `self` and `other`.
    #[must_use]
    pub fn min(self, other: AccessMode) -> AccessMode {
        if self <= other { self } else { other }
    }
}

/// What kind of thing a resource is.
///
/// The protocol only ever ships directory trees today; the enum exists so
/// the wire format has room to grow without a breaking change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// A directory tree.
    Directory,
}

/// Human task descriptor sent in INVITE.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Short one-line description (for listings and logs).
    pub description: String,
    /// Full prompt handed to the task executor.
    pub prompt: String,
}

/// A named resource offered to the executor, as known to the delegator.
///
/// `source` is delegator-local and **never** serialized onto the wire;
/// the executor only ever sees the [`ResourceManifestEntry`] projection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// Name the resource is materialized under.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Local source path (directory). Not part of the wire contract.
    pub source: PathBuf,
    /// Access mode granted to the executor.
    pub mode: AccessMode,
}

/// Wire projection of a [`ResourceSpec`]: name, kind, and mode only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceManifestEntry {
    /// Name the resource is materialized under.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Access mode granted to the executor.
    pub mode: AccessMode,
}

impl From<&ResourceSpec> for ResourceManifestEntry {
    fn from(spec: &ResourceSpec) -> Self {
        Self {
            name: spec.name.clone(),
            kind: spec.kind,
            mode: spec.mode,
        }
    }
}

/// The resource manifest carried inside INVITE.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentManifest {
    /// Offered resources, in declaration order.
    pub resources: Vec<ResourceManifestEntry>,
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

/// Requested lease terms (INVITE).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LeaseConfig {
    /// Requested lifetime in seconds.
    pub ttl_seconds: u64,
    /// Requested access mode.
    pub access_mode: AccessMode,
}

/// Granted lease (START and persisted records).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Instant the lease expires.
    pub expires_at: DateTime<Utc>,
    /// Granted access mode.
    pub access_mode: AccessMode,
}

impl Lease {
    /// Returns `true` once `now` is past the expiry instant.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Snapshot policy
// ---------------------------------------------------------------------------

/// What the delegator does with snapshots the executor emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotPolicy {
    /// Apply immediately on receipt.
    Auto,
    /// Persist to disk; wait for an explicit apply or discard.
    Staged,
    /// Drop without writing.
    Discard,
}

/// Resolved snapshot handling for one delegation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSettings {
    /// Handling policy.
    pub policy: SnapshotPolicy,
    /// How long staged snapshots are retained before the sweep discards them.
    pub retention_ms: u64,
    /// Upper bound on snapshots recorded for one delegation.
    pub max_snapshots: usize,
}

impl SnapshotSettings {
    /// Coerce the policy for a live-sync transport.
    ///
    /// Live-sync transports emit no snapshots, so any requested policy
    /// collapses to [`SnapshotPolicy::Auto`].
    #[must_use]
    pub fn coerced_for_live_sync(mut self, live_sync: bool) -> Self {
        if live_sync {
            self.policy = SnapshotPolicy::Auto;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Executor constraints
// ---------------------------------------------------------------------------

/// Sandbox posture the executor applies to the task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxProfile {
    /// Task is confined to the work directory.
    pub cwd_only: bool,
    /// Task may reach the network.
    pub allow_network: bool,
    /// Task may execute subprocesses.
    pub allow_exec: bool,
}

/// Constraints the executor reports in ACCEPT.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConstraints {
    /// Access mode the executor actually grants (never wider than requested).
    pub accepted_access_mode: AccessMode,
    /// Hard cap the executor places on the lease.
    pub max_ttl_seconds: u64,
    /// Sandbox posture for the task.
    pub sandbox_profile: SandboxProfile,
}

/// Work-directory advertisement in ACCEPT.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorWorkDir {
    /// Absolute path of the allocated work directory on the executor host.
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Results and snapshots
// ---------------------------------------------------------------------------

/// Terminal result reported by the executor's `done` event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Human summary of what the task did.
    pub summary: String,
    /// Notable items, in emphasis order.
    #[serde(default)]
    pub highlights: Vec<String>,
    /// Snapshots emitted during the run.
    #[serde(default)]
    pub snapshot_ids: Vec<String>,
}

/// Lifecycle of a received snapshot at the delegator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    /// Staged on disk, waiting for apply or discard.
    Pending,
    /// Applied to the source tree.
    Applied,
    /// Dropped without applying.
    Discarded,
}

/// Size statistics attached to a snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Number of files in the archive.
    pub file_count: u64,
    /// Uncompressed payload size in bytes.
    pub total_bytes: u64,
}

/// A snapshot received from the executor, tracked by the delegator.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSnapshot {
    /// Snapshot identifier (unique within the delegation).
    pub snapshot_id: String,
    /// Owning delegation.
    pub delegation_id: Uuid,
    /// Human summary provided by the executor.
    pub summary: String,
    /// Notable changes, in emphasis order.
    #[serde(default)]
    pub highlights: Vec<String>,
    /// Current status.
    pub status: SnapshotStatus,
    /// On-disk archive path (staged snapshots only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<PathBuf>,
    /// Size statistics, when the executor reported them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SnapshotMetadata>,
    /// Executor recommends applying this snapshot.
    #[serde(default)]
    pub recommended: bool,
    /// Instant the snapshot was recorded.
    pub created_at: DateTime<Utc>,
    /// Instant the snapshot was applied, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Record errors
// ---------------------------------------------------------------------------

/// Failures mutating a delegation or assignment record.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// A lifecycle event was not legal in the current state.
    #[error(transparent)]
    State(#[from] StateError),

    /// The named snapshot does not exist on this delegation.
    #[error("unknown snapshot {snapshot_id}")]
    UnknownSnapshot {
        /// The snapshot that was requested.
        snapshot_id: String,
    },

    /// Another snapshot is already applied; at most one may be.
    #[error("snapshot {existing} is already applied")]
    AlreadyApplied {
        /// The snapshot currently holding `applied` status.
        existing: String,
    },

    /// An applied snapshot cannot be discarded.
    #[error("snapshot {snapshot_id} is applied and cannot be discarded")]
    DiscardApplied {
        /// The snapshot that was asked to be discarded.
        snapshot_id: String,
    },
}

// ---------------------------------------------------------------------------
// Delegation record
// ---------------------------------------------------------------------------

/// The delegator-side record of one delegation, persisted as JSON.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Delegation {
    /// Delegation identifier (shared with the executor's assignment).
    pub id: Uuid,
    /// Base URL of the executor daemon.
    pub peer_url: String,
    /// Task descriptor.
    pub task: TaskSpec,
    /// Offered resources (delegator-local, includes source paths).
    pub environment: Vec<ResourceSpec>,
    /// Requested lease terms.
    pub lease_config: LeaseConfig,
    /// Resolved snapshot handling.
    pub snapshot_settings: SnapshotSettings,
    /// Data-plane transport for this delegation.
    pub transport: TransportKind,
    /// Current lifecycle state.
    pub state: DelegationState,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last mutation instant.
    pub updated_at: DateTime<Utc>,
    /// Work directory reported by the executor in ACCEPT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_work_dir: Option<ExecutorWorkDir>,
    /// Constraints reported by the executor in ACCEPT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_constraints: Option<ExecutorConstraints>,
    /// Granted lease, once START has been constructed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_lease: Option<Lease>,
    /// Materialized environment root, while one exists on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_root: Option<PathBuf>,
    /// Snapshots received so far, in arrival order (append-only).
    #[serde(default)]
    pub snapshots: Vec<EnvironmentSnapshot>,
    /// Identifier of the single applied snapshot, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_snapshot_id: Option<String>,
    /// Terminal result (`completed` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Terminal error (`error` / `cancelled` / `expired`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl Delegation {
    /// Create a fresh record in [`DelegationState::Created`].
    #[must_use]
    pub fn new(
        id: Uuid,
        peer_url: impl Into<String>,
        task: TaskSpec,
        environment: Vec<ResourceSpec>,
        lease_config: LeaseConfig,
        snapshot_settings: SnapshotSettings,
        transport: TransportKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            peer_url: peer_url.into(),
            task,
            environment,
            lease_config,
            snapshot_settings,
            transport,
            state: DelegationState::Created,
            created_at: now,
            updated_at: now,
            executor_work_dir: None,
            executor_constraints: None,
            active_lease: None,
            env_root: None,
            snapshots: Vec::new(),
            applied_snapshot_id: None,
            result: None,
            error: None,
        }
    }

    /// Apply a lifecycle event.
    ///
    /// On success the state advances and `updated_at` is stamped. On an
    /// illegal transition the record is left untouched.
    pub fn apply(&mut self, event: DelegationEvent) -> Result<DelegationState, StateError> {
        let next = delegation_next(self.state, event)?;
        self.state = next;
        self.touch();
        Ok(next)
    }

    /// Stamp `updated_at` after a non-lifecycle field mutation.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Returns `true` once the delegation is in a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Record a newly received snapshot (append-only).
    pub fn record_snapshot(&mut self, snapshot: EnvironmentSnapshot) {
        self.snapshots.push(snapshot);
        self.touch();
    }

    /// Look up a snapshot by id.
    #[must_use]
    pub fn snapshot(&self, snapshot_id: &str) -> Option<&EnvironmentSnapshot> {
        self.snapshots.iter().find(|s| s.snapshot_id == snapshot_id)
    }

    /// Returns `true` while any snapshot is still `pending`.
    #[must_use]
    pub fn has_pending_snapshots(&self) -> bool {
        self.snapshots
            .iter()
            .any(|s| s.status == SnapshotStatus::Pending)
    }

    /// Flip a snapshot to `applied`, enforcing the at-most-one rule.
    ///
    /// Applying the already-applied snapshot again is a no-op.
    pub fn mark_snapshot_applied(&mut self, snapshot_id: &str) -> Result<(), RecordError> {
        if let Some(existing) = &self.applied_snapshot_id {
            if existing == snapshot_id {
                return Ok(());
            }
            return Err(RecordError::AlreadyApplied {
                existing: existing.clone(),
            });
        }
        let snap = self
            .snapshots
            .iter_mut()
            .find(|s| s.snapshot_id == snapshot_id)
            .ok_or_else(|| RecordError::UnknownSnapshot {
                snapshot_id: snapshot_id.to_string(),
            })?;
        snap.status = SnapshotStatus::Applied;
        snap.applied_at = Some(Utc::now());
        self.applied_snapshot_id = Some(snapshot_id.to_string());
        self.touch();
        Ok(())
    }

    /// Flip a snapshot to `discarded`. Idempotent for already-discarded
    /// snapshots; refuses to discard the applied one.
    pub fn mark_snapshot_discarded(&mut self, snapshot_id: &str) -> Result<(), RecordError> {
        let snap = self
            .snapshots
            .iter_mut()
            .find(|s| s.snapshot_id == snapshot_id)
            .ok_or_else(|| RecordError::UnknownSnapshot {
                snapshot_id: snapshot_id.to_string(),
            })?;
        match snap.status {
            SnapshotStatus::Applied => Err(RecordError::DiscardApplied {
                snapshot_id: snapshot_id.to_string(),
            }),
            SnapshotStatus::Discarded => Ok(()),
            SnapshotStatus::Pending => {
                snap.status = SnapshotStatus::Discarded;
                self.touch();
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Assignment record
// ---------------------------------------------------------------------------

/// The executor-side mirror of a delegation, persisted as JSON.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Delegation identifier (mirrors the delegator's record).
    pub id: Uuid,
    /// Copy of the INVITE this assignment accepted.
    pub invite: InviteBody,
    /// Allocated work directory.
    pub work_path: PathBuf,
    /// Current lifecycle state.
    pub state: AssignmentState,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last mutation instant.
    pub updated_at: DateTime<Utc>,
    /// Granted lease, once START arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_lease: Option<Lease>,
    /// Terminal result (`completed` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Terminal error (`error` / `cancelled`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl Assignment {
    /// Create a fresh record in [`AssignmentState::Pending`].
    #[must_use]
    pub fn new(id: Uuid, invite: InviteBody, work_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            invite,
            work_path,
            state: AssignmentState::Pending,
            created_at: now,
            updated_at: now,
            active_lease: None,
            result: None,
            error: None,
        }
    }

    /// Apply a lifecycle event; see [`Delegation::apply`].
    pub fn apply(&mut self, event: AssignmentEvent) -> Result<AssignmentState, StateError> {
        let next = assignment_next(self.state, event)?;
        self.state = next;
        self.touch();
        Ok(next)
    }

    /// Stamp `updated_at` after a non-lifecycle field mutation.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Returns `true` once the assignment is in a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskSpec {
        TaskSpec {
            description: "touch a file".into(),
            prompt: "append ! to a.txt".into(),
        }
    }

    fn delegation() -> Delegation {
        Delegation::new(
            new_delegation_id(),
            "http://localhost:4001",
            task(),
            vec![ResourceSpec {
                name: "ws".into(),
                kind: ResourceKind::Directory,
                source: "/tmp/ws".into(),
                mode: AccessMode::Rw,
            }],
            LeaseConfig {
                ttl_seconds: 60,
                access_mode: AccessMode::Rw,
            },
            SnapshotSettings {
                policy: SnapshotPolicy::Staged,
                retention_ms: 60_000,
                max_snapshots: 4,
            },
            TransportKind::Archive,
        )
    }

    fn snapshot(delegation_id: Uuid, id: &str) -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            snapshot_id: id.into(),
            delegation_id,
            summary: "changed a.txt".into(),
            highlights: vec![],
            status: SnapshotStatus::Pending,
            archive_path: None,
            metadata: None,
            recommended: false,
            created_at: Utc::now(),
            applied_at: None,
        }
    }

    // -----------------------------------------------------------------------
    // Access mode
    // -----------------------------------------------------------------------

    #[test]
    fn access_mode_min_clamps_to_ro() {
        assert_eq!(AccessMode::Ro.min(AccessMode::Rw), AccessMode::Ro);
        assert_eq!(AccessMode::Rw.min(AccessMode::Ro), AccessMode::Ro);
        assert_eq!(AccessMode::Rw.min(AccessMode::Rw), AccessMode::Rw);
    }

    #[test]
    fn access_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&AccessMode::Ro).unwrap(), "\"ro\"");
        assert_eq!(serde_json::to_string(&AccessMode::Rw).unwrap(), "\"rw\"");
    }

    // -----------------------------------------------------------------------
    // Manifest projection
    // -----------------------------------------------------------------------

    #[test]
    fn manifest_entry_drops_source() {
        let spec = ResourceSpec {
            name: "ws".into(),
            kind: ResourceKind::Directory,
            source: "/home/user/secret-project".into(),
            mode: AccessMode::Ro,
        };
        let entry = ResourceManifestEntry::from(&spec);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("secret-project"));
        assert!(!json.contains("source"));
        assert!(json.contains("\"ws\""));
    }

    // -----------------------------------------------------------------------
    // Snapshot policy coercion
    // -----------------------------------------------------------------------

    #[test]
    fn live_sync_coerces_policy_to_auto() {
        let settings = SnapshotSettings {
            policy: SnapshotPolicy::Staged,
            retention_ms: 1,
            max_snapshots: 1,
        };
        assert_eq!(
            settings.coerced_for_live_sync(true).policy,
            SnapshotPolicy::Auto
        );
        assert_eq!(
            settings.coerced_for_live_sync(false).policy,
            SnapshotPolicy::Staged
        );
    }

    // -----------------------------------------------------------------------
    // Delegation snapshot bookkeeping
    // -----------------------------------------------------------------------

    #[test]
    fn at_most_one_snapshot_applied() {
        let mut d = delegation();
        let id = d.id;
        d.record_snapshot(snapshot(id, "snap_1"));
        d.record_snapshot(snapshot(id, "snap_2"));

        d.mark_snapshot_applied("snap_1").unwrap();
        assert_eq!(d.applied_snapshot_id.as_deref(), Some("snap_1"));

        let err = d.mark_snapshot_applied("snap_2").unwrap_err();
        assert!(matches!(err, RecordError::AlreadyApplied { .. }));
        assert_eq!(d.snapshot("snap_2").unwrap().status, SnapshotStatus::Pending);
    }

    #[test]
    fn apply_is_idempotent_for_same_snapshot() {
        let mut d = delegation();
        let id = d.id;
        d.record_snapshot(snapshot(id, "snap_1"));
        d.mark_snapshot_applied("snap_1").unwrap();
        d.mark_snapshot_applied("snap_1").unwrap();
        assert_eq!(d.snapshot("snap_1").unwrap().status, SnapshotStatus::Applied);
    }

    #[test]
    fn discard_is_idempotent_and_refuses_applied() {
        let mut d = delegation();
        let id = d.id;
        d.record_snapshot(snapshot(id, "snap_1"));
        d.record_snapshot(snapshot(id, "snap_2"));

        d.mark_snapshot_discarded("snap_1").unwrap();
        d.mark_snapshot_discarded("snap_1").unwrap();
        assert_eq!(
            d.snapshot("snap_1").unwrap().status,
            SnapshotStatus::Discarded
        );

        d.mark_snapshot_applied("snap_2").unwrap();
        let err = d.mark_snapshot_discarded("snap_2").unwrap_err();
        assert!(matches!(err, RecordError::DiscardApplied { .. }));
    }

    #[test]
    fn unknown_snapshot_is_an_error() {
        let mut d = delegation();
        let err = d.mark_snapshot_applied("snap_zzz").unwrap_err();
        assert!(matches!(err, RecordError::UnknownSnapshot { .. }));
    }

    #[test]
    fn pending_snapshot_tracking() {
        let mut d = delegation();
        let id = d.id;
        assert!(!d.has_pending_snapshots());
        d.record_snapshot(snapshot(id, "snap_1"));
        assert!(d.has_pending_snapshots());
        d.mark_snapshot_discarded("snap_1").unwrap();
        assert!(!d.has_pending_snapshots());
    }

    // -----------------------------------------------------------------------
    // Record serde
    // -----------------------------------------------------------------------

    #[test]
    fn delegation_roundtrips_through_json() {
        let mut d = delegation();
        d.apply(DelegationEvent::SendInvite).unwrap();
        let json = serde_json::to_string(&d).unwrap();
        let back: Delegation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, d.id);
        assert_eq!(back.state, DelegationState::Invited);
        assert_eq!(back.environment.len(), 1);
    }

    #[test]
    fn updated_at_advances_on_apply() {
        let mut d = delegation();
        let before = d.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        d.apply(DelegationEvent::SendInvite).unwrap();
        assert!(d.updated_at > before);
    }

    #[test]
    fn illegal_event_leaves_record_untouched() {
        let mut d = delegation();
        let before = d.updated_at;
        let err = d.apply(DelegationEvent::ReceiveDone);
        assert!(err.is_err());
        assert_eq!(d.state, DelegationState::Created);
        assert_eq!(d.updated_at, before);
    }
}
