// SPDX-License-Identifier: MIT OR Apache-2.0
//! The delegator service: owns delegation records and drives the protocol.
//!
//! Every delegation lives behind its own `tokio::sync::Mutex`, so at most
//! one lifecycle transition is in flight per id. `delegate` is synchronous
//! up to INVITE/ACCEPT; transport preparation, START, and event-stream
//! consumption run in a background task per delegation. Resource release
//! happens exactly once per delegation: the record's `env_root` option is
//! the latch.

use anyhow::Context as _;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use awcp_config::DelegatorConfig;
use awcp_core::error::{ErrorCode, ErrorRecord};
use awcp_core::event::TaskEvent;
use awcp_core::handle::{TransportHandle, TransportKind};
use awcp_core::message::{
    AuthClaim, ControlBody, ControlMessage, InviteBody, StartBody, TransportRequirements,
};
use awcp_core::state::{DelegationEvent, DelegationState};
use awcp_core::{
    AccessMode, Delegation, EnvironmentManifest, EnvironmentSnapshot, Lease, LeaseConfig,
    RecordError, ResourceManifestEntry, ResourceSpec, SnapshotMetadata, SnapshotPolicy,
    SnapshotSettings, SnapshotStatus, TaskResult, TaskSpec, new_delegation_id,
};
use awcp_transport::{ApplySnapshotRequest, DelegatorTransportRegistry, PrepareRequest};

use crate::admission::AdmissionController;
use crate::client::ExecutorClient;
use crate::environment::{EnvironmentManager, LinkMode};
use crate::persist::DelegationStore;
use crate::snapshots::SnapshotStore;

type Entry = Arc<Mutex<Delegation>>;

// ---------------------------------------------------------------------------
// Parameters and errors
// ---------------------------------------------------------------------------

/// Caller-supplied input to [`DelegatorService::delegate`].
#[derive(Debug, Clone)]
pub struct DelegateParams {
    /// Base URL of the executor daemon.
    pub executor_url: String,
    /// Task descriptor.
    pub task: TaskSpec,
    /// Offered resources (source paths are delegator-local).
    pub resources: Vec<ResourceSpec>,
    /// Lease TTL override, in seconds.
    pub ttl_seconds: Option<u64>,
    /// Access mode override.
    pub access_mode: Option<AccessMode>,
    /// Snapshot policy override.
    pub snapshot_policy: Option<SnapshotPolicy>,
    /// Transport override (default: archive).
    pub transport: Option<TransportKind>,
    /// Credential claim forwarded in INVITE.
    pub auth: Option<AuthClaim>,
}

/// Failure of the synchronous part of `delegate`.
#[derive(Debug, thiserror::Error)]
pub enum DelegateError {
    /// A protocol-visible refusal (admission, executor ERROR reply).
    #[error(transparent)]
    Protocol(ErrorRecord),

    /// An internal failure with no protocol code.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Failure of a snapshot apply/discard operation.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotOpError {
    /// The delegation id is unknown.
    #[error("delegation not found")]
    UnknownDelegation,

    /// The snapshot id is unknown on this delegation.
    #[error("snapshot not found")]
    UnknownSnapshot,

    /// The operation conflicts with current snapshot state.
    #[error("{0}")]
    Conflict(String),

    /// The transport failed applying the snapshot.
    #[error(transparent)]
    Transport(ErrorRecord),

    /// An internal failure with no protocol code.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Outcome of waiting for a delegation to finish.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The delegation id is unknown.
    #[error("delegation not found")]
    UnknownDelegation,

    /// The delegation did not reach a terminal state in time.
    #[error("timed out after {0:?} waiting for completion")]
    Timeout(Duration),
}

fn parse_policy(raw: &str) -> SnapshotPolicy {
    match raw {
        "auto" => SnapshotPolicy::Auto,
        "discard" => SnapshotPolicy::Discard,
        _ => SnapshotPolicy::Staged,
    }
}

fn parse_access_mode(raw: &str) -> AccessMode {
    if raw == "rw" { AccessMode::Rw } else { AccessMode::Ro }
}

fn sse_failed(detail: impl std::fmt::Display) -> ErrorRecord {
    ErrorRecord::new(ErrorCode::SseFailed, "task event stream failed")
        .with_hint(detail.to_string())
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Owns all delegation state on the delegator side.
pub struct DelegatorService {
    config: DelegatorConfig,
    admission: AdmissionController,
    environments: EnvironmentManager,
    snapshots: SnapshotStore,
    store: DelegationStore,
    client: ExecutorClient,
    transports: DelegatorTransportRegistry,
    delegations: StdMutex<HashMap<Uuid, Entry>>,
    tasks: StdMutex<HashMap<Uuid, tokio::task::JoinHandle<()>>>,
}

impl DelegatorService {
    /// Build the service from validated configuration and a transport
    /// registry.
    ///
    /// # Errors
    ///
    /// Fails when a configured sensitive pattern is not a valid glob.
    pub fn new(
        config: DelegatorConfig,
        transports: DelegatorTransportRegistry,
    ) -> anyhow::Result<Arc<Self>> {
        let admission =
            AdmissionController::new(&config).context("compile sensitive patterns")?;
        let client = ExecutorClient::new(&config);
        Ok(Arc::new(Self {
            admission,
            environments: EnvironmentManager::new(&config.base_dir),
            snapshots: SnapshotStore::new(&config.base_dir),
            store: DelegationStore::new(&config.base_dir),
            client,
            transports,
            delegations: StdMutex::new(HashMap::new()),
            tasks: StdMutex::new(HashMap::new()),
            config,
        }))
    }

    fn entry(&self, id: Uuid) -> Option<Entry> {
        self.delegations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn insert_entry(&self, delegation: Delegation) -> Entry {
        let id = delegation.id;
        let entry = Arc::new(Mutex::new(delegation));
        self.delegations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, Arc::clone(&entry));
        entry
    }

    fn persist(&self, delegation: &Delegation) {
        if let Err(err) = self.store.save(delegation) {
            error!(delegation_id = %delegation.id, error = %err, "failed to persist delegation");
        }
    }

    // -----------------------------------------------------------------------
    // delegate
    // -----------------------------------------------------------------------

    /// Create a delegation: validate and admit resources, materialize the
    /// environment, exchange INVITE/ACCEPT, then hand off to a background
    /// task for START and event-stream consumption.
    ///
    /// # Errors
    ///
    /// Everything up to and including the ACCEPT is synchronous; failures
    /// are returned to the caller and the partial delegation is released.
    pub async fn delegate(self: &Arc<Self>, params: DelegateParams) -> Result<Uuid, DelegateError> {
        let id = new_delegation_id();

        // 1. Validate and admit every resource before touching disk.
        let mut resources = Vec::with_capacity(params.resources.len());
        for resource in params.resources {
            let source = normalize_source(&resource.source).map_err(DelegateError::Protocol)?;
            if !source.is_dir() {
                return Err(DelegateError::Protocol(
                    ErrorRecord::new(
                        ErrorCode::WorkspaceInvalid,
                        format!("{} is not a directory", source.display()),
                    )
                    .with_hint("resources must name directories"),
                ));
            }
            self.admission
                .check(&source, id)
                .map_err(DelegateError::Protocol)?;
            resources.push(ResourceSpec { source, ..resource });
        }

        // 2. Resolve transport and effective policy.
        let transport_kind = params.transport.unwrap_or(TransportKind::Archive);
        let adapter = self
            .transports
            .get(transport_kind)
            .map_err(|e| DelegateError::Protocol(e.to_error_record()))?;
        let capabilities = adapter.capabilities();

        let ttl_seconds = params.ttl_seconds.unwrap_or(self.config.default_ttl_seconds);
        let access_mode = params
            .access_mode
            .unwrap_or_else(|| parse_access_mode(&self.config.default_access_mode));
        let snapshot_settings = SnapshotSettings {
            policy: params
                .snapshot_policy
                .unwrap_or_else(|| parse_policy(&self.config.default_snapshot_policy)),
            retention_ms: self.config.snapshot_retention_ms,
            max_snapshots: self.config.max_snapshots,
        }
        .coerced_for_live_sync(capabilities.live_sync);

        // 3. Materialize the environment and persist the fresh record.
        let env_root = self
            .environments
            .build(id, &resources, LinkMode::Symlink)
            .context("materialize environment")?;

        let mut delegation = Delegation::new(
            id,
            params.executor_url.clone(),
            params.task.clone(),
            resources,
            LeaseConfig {
                ttl_seconds,
                access_mode,
            },
            snapshot_settings,
            transport_kind,
        );
        delegation.env_root = Some(env_root);

        // 4. INVITE carries manifest entries only — never source paths.
        let invite = ControlMessage::new(
            id,
            ControlBody::Invite(InviteBody {
                task: params.task,
                lease: LeaseConfig {
                    ttl_seconds,
                    access_mode,
                },
                environment: EnvironmentManifest {
                    resources: delegation
                        .environment
                        .iter()
                        .map(ResourceManifestEntry::from)
                        .collect(),
                },
                requirements: TransportRequirements {
                    transport: transport_kind,
                },
                auth: params.auth,
            }),
        );

        delegation
            .apply(DelegationEvent::SendInvite)
            .context("send invite transition")?;
        let entry = self.insert_entry(delegation);
        {
            let guard = entry.lock().await;
            self.persist(&guard);
        }

        // 5. INVITE/ACCEPT exchange, synchronous.
        let reply = self.client.send_invite(&params.executor_url, &invite).await;
        let mut guard = entry.lock().await;
        match reply {
            Ok(message) => match message.body {
                ControlBody::Accept(accept) => {
                    guard.executor_work_dir = Some(accept.executor_work_dir);
                    guard.executor_constraints = Some(accept.executor_constraints);
                    guard
                        .apply(DelegationEvent::ReceiveAccept)
                        .context("receive accept transition")?;
                    self.persist(&guard);
                    info!(delegation_id = %id, executor = %params.executor_url, "delegation accepted");
                }
                ControlBody::Error(record) => {
                    let _ = guard.apply(DelegationEvent::ReceiveError);
                    guard.error = Some(record.clone());
                    self.persist(&guard);
                    self.release_locked(&mut guard).await;
                    return Err(DelegateError::Protocol(record));
                }
                other => {
                    let record = ErrorRecord::new(
                        ErrorCode::TransportError,
                        format!("unexpected reply to INVITE: {other:?}"),
                    );
                    let _ = guard.apply(DelegationEvent::ReceiveError);
                    guard.error = Some(record.clone());
                    self.persist(&guard);
                    self.release_locked(&mut guard).await;
                    return Err(DelegateError::Protocol(record));
                }
            },
            Err(err) => {
                let record =
                    ErrorRecord::new(ErrorCode::TransportError, format!("INVITE failed: {err}"));
                let _ = guard.apply(DelegationEvent::ReceiveError);
                guard.error = Some(record.clone());
                self.persist(&guard);
                self.release_locked(&mut guard).await;
                return Err(DelegateError::Protocol(record));
            }
        }
        drop(guard);

        // 6. Everything past ACCEPT is asynchronous.
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(record) = service.run_delegation(id).await {
                service.fail_delegation(id, record).await;
            }
            service
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&id);
        });
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, handle);

        Ok(id)
    }

    /// Prepare the transport, open the event stream, send START, and
    /// consume events until a terminal one.
    async fn run_delegation(self: &Arc<Self>, id: Uuid) -> Result<(), ErrorRecord> {
        let Some(entry) = self.entry(id) else {
            return Ok(());
        };

        // Snapshot what the background phase needs, then drop the lock for
        // the long-running transport work.
        let (peer_url, transport_kind, env_root, ttl_seconds, access_mode) = {
            let guard = entry.lock().await;
            if guard.is_terminal() {
                return Ok(());
            }
            (
                guard.peer_url.clone(),
                guard.transport,
                guard.env_root.clone().unwrap_or_default(),
                guard.lease_config.ttl_seconds,
                guard.lease_config.access_mode,
            )
        };

        let adapter = self
            .transports
            .get(transport_kind)
            .map_err(|e| e.to_error_record())?;

        let handle = adapter
            .prepare(PrepareRequest {
                delegation_id: id,
                env_root,
                ttl_seconds,
            })
            .await
            .map_err(|e| e.to_error_record())?;

        let lease = Lease {
            expires_at: Utc::now() + ChronoDuration::seconds(ttl_seconds as i64),
            access_mode,
        };
        {
            let mut guard = entry.lock().await;
            guard.active_lease = Some(lease);
            guard.touch();
            self.persist(&guard);
        }

        // The subscription is established before START leaves, so a task
        // that finishes instantly cannot complete before we listen.
        let mut stream = self
            .client
            .subscribe_events(&peer_url, id)
            .await
            .map_err(|e| sse_failed(e))?;

        let chunks = adapter
            .outbound_chunks(id)
            .await
            .map_err(|e| e.to_error_record())?;
        if !chunks.is_empty() {
            let TransportHandle::Archive { ref sha256, .. } = handle else {
                return Err(ErrorRecord::new(
                    ErrorCode::TransportError,
                    "chunked upload requested by a non-archive handle",
                ));
            };
            let total = sha256.clone();
            self.client
                .upload_chunks(&peer_url, id, &chunks, &total)
                .await
                .map_err(|e| {
                    ErrorRecord::new(ErrorCode::TransportError, format!("chunk upload failed: {e}"))
                })?;
        }

        let start = ControlMessage::new(
            id,
            ControlBody::Start(StartBody {
                lease,
                work_dir: handle,
            }),
        );
        {
            let mut guard = entry.lock().await;
            if guard.apply(DelegationEvent::SendStart).is_err() {
                // Cancelled while preparing; nothing more to do.
                return Ok(());
            }
            self.persist(&guard);
        }
        self.client
            .send_start(&peer_url, &start)
            .await
            .map_err(|e| {
                ErrorRecord::new(ErrorCode::TransportError, format!("START failed: {e}"))
            })?;

        // 7. Consume the stream until a terminal event.
        loop {
            match stream.next_event().await {
                Some(Ok(event)) => {
                    if self.handle_event(&entry, event).await? {
                        return Ok(());
                    }
                }
                Some(Err(err)) => return Err(sse_failed(err)),
                None => {
                    let guard = entry.lock().await;
                    if guard.is_terminal() {
                        return Ok(());
                    }
                    return Err(sse_failed("stream ended before a terminal event"));
                }
            }
        }
    }

    /// Apply one task event; returns `true` once a terminal event has
    /// been fully handled.
    async fn handle_event(
        self: &Arc<Self>,
        entry: &Entry,
        event: TaskEvent,
    ) -> Result<bool, ErrorRecord> {
        match event {
            TaskEvent::Status { status, .. } => {
                let mut guard = entry.lock().await;
                if guard.state == DelegationState::Started {
                    let _ = guard.apply(DelegationEvent::SetupComplete);
                    self.persist(&guard);
                    debug!(delegation_id = %guard.id, ?status, "delegation running");
                }
                Ok(false)
            }

            TaskEvent::Snapshot {
                snapshot_id,
                summary,
                highlights,
                snapshot_base64,
                metadata,
                recommended,
            } => {
                self.handle_snapshot(
                    entry,
                    snapshot_id,
                    summary,
                    highlights,
                    snapshot_base64,
                    metadata,
                    recommended,
                )
                .await?;
                Ok(false)
            }

            TaskEvent::Done {
                summary,
                highlights,
                snapshot_ids,
                ..
            } => {
                let mut guard = entry.lock().await;
                let id = guard.id;
                if guard.apply(DelegationEvent::ReceiveDone).is_err() {
                    // Raced with cancel; the terminal state stands.
                    return Ok(true);
                }
                guard.result = Some(TaskResult {
                    summary,
                    highlights,
                    snapshot_ids,
                });
                self.persist(&guard);
                info!(delegation_id = %id, "delegation completed");

                let peer = guard.peer_url.clone();
                if !guard.has_pending_snapshots() {
                    self.release_locked(&mut guard).await;
                }
                drop(guard);

                if let Err(err) = self.client.send_ack(&peer, id).await {
                    warn!(delegation_id = %id, error = %err, "result ack failed");
                }
                Ok(true)
            }

            TaskEvent::Error(record) => {
                let mut guard = entry.lock().await;
                if guard.apply(DelegationEvent::ReceiveError).is_ok() {
                    guard.error = Some(record);
                    self.persist(&guard);
                }
                self.release_locked(&mut guard).await;
                Ok(true)
            }
        }
    }

    /// Record a snapshot event according to the delegation's policy.
    #[allow(clippy::too_many_arguments)]
    async fn handle_snapshot(
        self: &Arc<Self>,
        entry: &Entry,
        snapshot_id: String,
        summary: String,
        highlights: Vec<String>,
        snapshot_base64: String,
        metadata: Option<SnapshotMetadata>,
        recommended: bool,
    ) -> Result<(), ErrorRecord> {
        let mut guard = entry.lock().await;
        let delegation_id = guard.id;

        if guard.snapshots.len() >= guard.snapshot_settings.max_snapshots {
            warn!(
                delegation_id = %delegation_id,
                snapshot_id,
                "snapshot limit reached; ignoring snapshot event"
            );
            return Ok(());
        }

        let bytes = BASE64.decode(&snapshot_base64).map_err(|e| {
            ErrorRecord::new(
                ErrorCode::TransportError,
                format!("snapshot payload decode failed: {e}"),
            )
        })?;

        let mut record = EnvironmentSnapshot {
            snapshot_id: snapshot_id.clone(),
            delegation_id,
            summary,
            highlights,
            status: SnapshotStatus::Pending,
            archive_path: None,
            metadata,
            recommended,
            created_at: Utc::now(),
            applied_at: None,
        };

        match guard.snapshot_settings.policy {
            SnapshotPolicy::Auto => {
                let adapter = self
                    .transports
                    .get(guard.transport)
                    .map_err(|e| e.to_error_record())?;
                adapter
                    .apply_snapshot(ApplySnapshotRequest {
                        delegation_id,
                        snapshot_bytes: bytes,
                        resources: guard.environment.clone(),
                    })
                    .await
                    .map_err(|e| e.to_error_record())?;

                guard.record_snapshot(record);
                if let Err(RecordError::AlreadyApplied { existing }) =
                    guard.mark_snapshot_applied(&snapshot_id)
                {
                    // Auto mode keeps only the newest snapshot applied.
                    if let Some(prev) = guard
                        .snapshots
                        .iter_mut()
                        .find(|s| s.snapshot_id == existing)
                    {
                        prev.status = SnapshotStatus::Discarded;
                    }
                    guard.applied_snapshot_id = None;
                    let _ = guard.mark_snapshot_applied(&snapshot_id);
                }
                info!(delegation_id = %delegation_id, snapshot_id, "snapshot auto-applied");
            }
            SnapshotPolicy::Staged => {
                let path = self.snapshots.stage(&record, &bytes).map_err(|e| {
                    ErrorRecord::new(
                        ErrorCode::TransportError,
                        format!("failed to stage snapshot: {e}"),
                    )
                })?;
                record.archive_path = Some(path);
                guard.record_snapshot(record);
                info!(delegation_id = %delegation_id, snapshot_id, "snapshot staged");
            }
            SnapshotPolicy::Discard => {
                record.status = SnapshotStatus::Discarded;
                guard.record_snapshot(record);
                debug!(delegation_id = %delegation_id, snapshot_id, "snapshot discarded by policy");
            }
        }

        self.persist(&guard);
        Ok(())
    }

    /// Force a delegation into `error` and release its resources.
    async fn fail_delegation(self: &Arc<Self>, id: Uuid, record: ErrorRecord) {
        let Some(entry) = self.entry(id) else {
            return;
        };
        let mut guard = entry.lock().await;
        if guard.is_terminal() {
            return;
        }
        warn!(delegation_id = %id, code = %record.code, "delegation failed");
        let _ = guard.apply(DelegationEvent::ReceiveError);
        guard.error = Some(record);
        self.persist(&guard);
        self.release_locked(&mut guard).await;
    }

    /// Release transport state and the environment root. The `env_root`
    /// option on the record is the exactly-once latch; repeated calls are
    /// no-ops.
    async fn release_locked(&self, delegation: &mut Delegation) {
        if delegation.env_root.take().is_none() {
            return;
        }
        if let Ok(adapter) = self.transports.get(delegation.transport) {
            if let Err(err) = adapter.release(delegation.id).await {
                warn!(delegation_id = %delegation.id, error = %err, "transport release failed");
            }
        }
        if let Err(err) = self.environments.release(delegation.id) {
            warn!(delegation_id = %delegation.id, error = %err, "environment release failed");
        }
        delegation.touch();
        self.persist(delegation);
    }

    // -----------------------------------------------------------------------
    // Cancel / wait / queries
    // -----------------------------------------------------------------------

    /// Cancel a delegation. Idempotent: cancelling a terminal delegation
    /// succeeds without effect. Returns `false` for unknown ids.
    pub async fn cancel(self: &Arc<Self>, id: Uuid) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        let mut guard = entry.lock().await;
        if guard.is_terminal() {
            return true;
        }

        info!(delegation_id = %id, "cancelling delegation");
        let _ = guard.apply(DelegationEvent::Cancel);
        guard.error = Some(ErrorRecord::cancelled());
        self.persist(&guard);

        if let Some(handle) = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&id)
        {
            handle.abort();
        }

        let peer = guard.peer_url.clone();
        self.release_locked(&mut guard).await;
        drop(guard);

        if let Err(err) = self.client.send_cancel(&peer, id).await {
            warn!(delegation_id = %id, error = %err, "best-effort cancel failed");
        }
        true
    }

    /// Poll until the delegation reaches a terminal state.
    ///
    /// # Errors
    ///
    /// [`WaitError::UnknownDelegation`] or [`WaitError::Timeout`].
    pub async fn wait_for_completion(
        &self,
        id: Uuid,
        timeout: Duration,
    ) -> Result<DelegationState, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let Some(entry) = self.entry(id) else {
                return Err(WaitError::UnknownDelegation);
            };
            {
                let guard = entry.lock().await;
                if guard.is_terminal() {
                    return Ok(guard.state);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Snapshot of one delegation record.
    pub async fn get(&self, id: Uuid) -> Option<Delegation> {
        let entry = self.entry(id)?;
        let guard = entry.lock().await;
        Some(guard.clone())
    }

    /// Snapshots of all delegation records, oldest first.
    pub async fn list(&self) -> Vec<Delegation> {
        let entries: Vec<Entry> = {
            self.delegations
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .values()
                .cloned()
                .collect()
        };
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(entry.lock().await.clone());
        }
        records.sort_by_key(|r| r.created_at);
        records
    }

    // -----------------------------------------------------------------------
    // Snapshot operations
    // -----------------------------------------------------------------------

    /// Apply a staged snapshot to the delegation's `rw` resources.
    ///
    /// # Errors
    ///
    /// See [`SnapshotOpError`]. Applying the already-applied snapshot
    /// again is a no-op success.
    pub async fn apply_snapshot(
        self: &Arc<Self>,
        id: Uuid,
        snapshot_id: &str,
    ) -> Result<(), SnapshotOpError> {
        let entry = self.entry(id).ok_or(SnapshotOpError::UnknownDelegation)?;
        let mut guard = entry.lock().await;

        let status = guard
            .snapshot(snapshot_id)
            .map(|s| s.status)
            .ok_or(SnapshotOpError::UnknownSnapshot)?;
        match status {
            SnapshotStatus::Applied => return Ok(()),
            SnapshotStatus::Discarded => {
                return Err(SnapshotOpError::Conflict(format!(
                    "snapshot {snapshot_id} was discarded"
                )));
            }
            SnapshotStatus::Pending => {}
        }

        let bytes = self
            .snapshots
            .load(id, snapshot_id)
            .context("load staged snapshot")?;
        let adapter = self
            .transports
            .get(guard.transport)
            .map_err(|e| SnapshotOpError::Transport(e.to_error_record()))?;
        adapter
            .apply_snapshot(ApplySnapshotRequest {
                delegation_id: id,
                snapshot_bytes: bytes,
                resources: guard.environment.clone(),
            })
            .await
            .map_err(|e| SnapshotOpError::Transport(e.to_error_record()))?;

        guard
            .mark_snapshot_applied(snapshot_id)
            .map_err(|e| SnapshotOpError::Conflict(e.to_string()))?;
        if let Err(err) = self.snapshots.discard(id, snapshot_id) {
            warn!(delegation_id = %id, snapshot_id, error = %err, "failed to drop staged bytes after apply");
        }
        self.persist(&guard);
        info!(delegation_id = %id, snapshot_id, "snapshot applied");

        if guard.is_terminal() && !guard.has_pending_snapshots() {
            self.release_locked(&mut guard).await;
        }
        Ok(())
    }

    /// Discard a staged snapshot without applying it. Idempotent.
    ///
    /// # Errors
    ///
    /// See [`SnapshotOpError`].
    pub async fn discard_snapshot(
        self: &Arc<Self>,
        id: Uuid,
        snapshot_id: &str,
    ) -> Result<(), SnapshotOpError> {
        let entry = self.entry(id).ok_or(SnapshotOpError::UnknownDelegation)?;
        let mut guard = entry.lock().await;

        if guard.snapshot(snapshot_id).is_none() {
            return Err(SnapshotOpError::UnknownSnapshot);
        }
        guard
            .mark_snapshot_discarded(snapshot_id)
            .map_err(|e| SnapshotOpError::Conflict(e.to_string()))?;
        self.snapshots
            .discard(id, snapshot_id)
            .context("remove staged snapshot")?;
        self.persist(&guard);
        info!(delegation_id = %id, snapshot_id, "snapshot discarded");

        if guard.is_terminal() && !guard.has_pending_snapshots() {
            self.release_locked(&mut guard).await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery and sweep
    // -----------------------------------------------------------------------

    /// Reload persisted records after a restart.
    ///
    /// Non-terminal delegations are forced to `error { SSE_FAILED }` —
    /// there is no live event stream to resume — and their resources are
    /// released. Environment and snapshot directories for unknown ids are
    /// removed.
    ///
    /// # Errors
    ///
    /// Fails only if the record directory cannot be listed.
    pub async fn recover(self: &Arc<Self>) -> anyhow::Result<usize> {
        let records = self.store.load_all()?;
        let mut known = HashSet::new();
        let mut forced = Vec::new();

        for mut record in records {
            known.insert(record.id);
            if !record.is_terminal() {
                let _ = record.apply(DelegationEvent::ReceiveError);
                record.error = Some(
                    ErrorRecord::new(ErrorCode::SseFailed, "delegator restarted mid-delegation")
                        .with_hint("the event stream could not be resumed after restart"),
                );
                forced.push(record.id);
            }
            self.insert_entry(record);
        }

        let loaded = known.len();
        self.environments.cleanup_stale(&known);
        self.snapshots.cleanup_stale(&known);

        for id in forced {
            if let Some(entry) = self.entry(id) {
                let mut guard = entry.lock().await;
                self.persist(&guard);
                self.release_locked(&mut guard).await;
            }
        }

        info!(loaded, "delegator state recovered");
        Ok(loaded)
    }

    /// One pass of the periodic cleanup sweep: lease expiry, staged
    /// snapshot retention, terminal-record retention, orphan directories.
    pub async fn sweep_once(self: &Arc<Self>) {
        let now = Utc::now();
        let ids: Vec<Uuid> = {
            self.delegations
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .keys()
                .copied()
                .collect()
        };

        let mut to_remove = Vec::new();
        for id in &ids {
            let Some(entry) = self.entry(*id) else {
                continue;
            };
            let mut guard = entry.lock().await;

            // Lease expiry promotes non-terminal delegations to `expired`.
            if !guard.is_terminal()
                && guard
                    .active_lease
                    .is_some_and(|lease| lease.is_expired(now))
            {
                info!(delegation_id = %id, "lease expired");
                let _ = guard.apply(DelegationEvent::Expire);
                self.persist(&guard);
                if let Some(handle) = self
                    .tasks
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(id)
                {
                    handle.abort();
                }
                self.release_locked(&mut guard).await;
            }

            // Staged snapshots past their retention are discarded.
            let retention =
                ChronoDuration::milliseconds(guard.snapshot_settings.retention_ms as i64);
            let expired: Vec<String> = guard
                .snapshots
                .iter()
                .filter(|s| s.status == SnapshotStatus::Pending && s.created_at + retention < now)
                .map(|s| s.snapshot_id.clone())
                .collect();
            for snapshot_id in expired {
                info!(delegation_id = %id, snapshot_id, "staged snapshot retention elapsed");
                let _ = guard.mark_snapshot_discarded(&snapshot_id);
                let _ = self.snapshots.discard(*id, &snapshot_id);
                self.persist(&guard);
            }

            // Terminal records past retention are deleted entirely, but
            // only once no snapshot is pending.
            let retention_window = ChronoDuration::seconds(self.config.retention_secs as i64);
            if guard.is_terminal()
                && !guard.has_pending_snapshots()
                && guard.updated_at + retention_window < now
            {
                self.release_locked(&mut guard).await;
                if let Err(err) = self.store.delete(*id) {
                    warn!(delegation_id = %id, error = %err, "failed to delete record");
                }
                self.snapshots.remove_all(*id);
                to_remove.push(*id);
            }
        }

        if !to_remove.is_empty() {
            {
                let mut map = self
                    .delegations
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                for id in &to_remove {
                    map.remove(id);
                }
            }
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for id in &to_remove {
                tasks.remove(id);
            }
            info!(removed = to_remove.len(), "retention sweep removed delegations");
        }

        let known: HashSet<Uuid> = {
            self.delegations
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .keys()
                .copied()
                .collect()
        };
        self.environments.cleanup_stale(&known);
        self.snapshots.cleanup_stale(&known);
    }

    /// The configured sweep interval.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.config.sweep_interval_secs)
    }
}

/// Normalize a resource source path: relative paths resolve against the
/// current directory, and the result must exist.
fn normalize_source(source: &PathBuf) -> Result<PathBuf, ErrorRecord> {
    let absolute = if source.is_absolute() {
        source.clone()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(source))
            .unwrap_or_else(|_| source.clone())
    };
    absolute.canonicalize().map_err(|_| {
        ErrorRecord::new(
            ErrorCode::WorkspaceNotFound,
            format!("{} does not exist", absolute.display()),
        )
        .with_hint("check the resource source path")
    })
}
