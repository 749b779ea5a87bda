// SPDX-License-Identifier: MIT OR Apache-2.0
//! The executor service: owns assignment records and runs tasks.
//!
//! INVITE handling is synchronous (the ACCEPT or ERROR rides the HTTP
//! response); START triggers a background task per assignment that
//! prepares the workspace, sets up the transport, runs the user task
//! executor, captures a snapshot when supported, and emits ordered
//! events to the assignment's channel. Terminal state is persisted
//! before the terminal event is emitted.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use awcp_config::ExecutorConfig;
use awcp_core::error::{ErrorCode, ErrorRecord};
use awcp_core::event::{TaskEvent, TaskStatus};
use awcp_core::handle::TransportHandle;
use awcp_core::message::{AcceptBody, ControlBody, ControlMessage, InviteBody, StartBody};
use awcp_core::state::{AssignmentEvent, AssignmentState};
use awcp_core::{
    AccessMode, Assignment, ExecutorConstraints, ExecutorWorkDir, SandboxProfile, TaskResult,
    new_snapshot_id,
};
use awcp_transport::chunk::ChunkStore;
use awcp_transport::{CaptureRequest, ExecutorTransportRegistry, SetupRequest};

use crate::admission::AdmissionPolicy;
use crate::assignments::AssignmentStore;
use crate::cancel::CancellationToken;
use crate::channel::{EventChannel, Subscription};
use crate::task::{TaskContext, TaskExecutor};
use crate::workspace::WorkspaceManager;

type Entry = Arc<Mutex<Assignment>>;

/// What an SSE subscriber receives.
pub enum SubscribeOutcome {
    /// Unknown id; emit this synthesized error event and end the stream.
    NotFound(TaskEvent),
    /// The assignment already finished; replay the terminal event once.
    Replay(TaskEvent),
    /// Live subscription.
    Live(tokio::sync::broadcast::Receiver<TaskEvent>),
}

/// Owns all assignment state on the executor side.
pub struct ExecutorService {
    config: ExecutorConfig,
    policy: AdmissionPolicy,
    workspaces: WorkspaceManager,
    store: AssignmentStore,
    transports: ExecutorTransportRegistry,
    chunks: Arc<ChunkStore>,
    task_executor: Arc<dyn TaskExecutor>,
    assignments: StdMutex<HashMap<Uuid, Entry>>,
    channels: StdMutex<HashMap<Uuid, Arc<EventChannel>>>,
    cancels: StdMutex<HashMap<Uuid, CancellationToken>>,
    active: AtomicUsize,
}

impl ExecutorService {
    /// Build the service.
    ///
    /// # Errors
    ///
    /// Fails when the work directory cannot be created.
    pub fn new(
        config: ExecutorConfig,
        transports: ExecutorTransportRegistry,
        chunks: Arc<ChunkStore>,
        task_executor: Arc<dyn TaskExecutor>,
    ) -> anyhow::Result<Arc<Self>> {
        let workspaces = WorkspaceManager::new(&config.work_dir)?;
        let store = AssignmentStore::new(&config.work_dir);
        Ok(Arc::new(Self {
            policy: AdmissionPolicy::new(&config),
            workspaces,
            store,
            transports,
            chunks,
            task_executor,
            assignments: StdMutex::new(HashMap::new()),
            channels: StdMutex::new(HashMap::new()),
            cancels: StdMutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            config,
        }))
    }

    /// The chunk store backing the archive transport (shared with the
    /// daemon's chunk endpoints).
    #[must_use]
    pub fn chunk_store(&self) -> Arc<ChunkStore> {
        Arc::clone(&self.chunks)
    }

    fn entry(&self, id: Uuid) -> Option<Entry> {
        self.assignments
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn channel(&self, id: Uuid) -> Option<Arc<EventChannel>> {
        self.channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn token(&self, id: Uuid) -> Option<CancellationToken> {
        self.cancels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn persist(&self, assignment: &Assignment) {
        if let Err(err) = self.store.save(assignment) {
            warn!(delegation_id = %assignment.id, error = %err, "failed to persist assignment");
        }
    }

    fn sandbox_profile(&self) -> SandboxProfile {
        SandboxProfile {
            cwd_only: self.config.sandbox.cwd_only,
            allow_network: self.config.sandbox.allow_network,
            allow_exec: self.config.sandbox.allow_exec,
        }
    }

    fn constraints(&self, requested: AccessMode) -> ExecutorConstraints {
        let ceiling = if self.config.accept_rw {
            AccessMode::Rw
        } else {
            AccessMode::Ro
        };
        ExecutorConstraints {
            accepted_access_mode: requested.min(ceiling),
            max_ttl_seconds: self.config.max_ttl_seconds,
            sandbox_profile: self.sandbox_profile(),
        }
    }

    // -----------------------------------------------------------------------
    // Control-plane entry point
    // -----------------------------------------------------------------------

    /// Dispatch one control message; the return value (if any) rides the
    /// HTTP response.
    ///
    /// # Errors
    ///
    /// A protocol-visible refusal, which the daemon wraps into an ERROR
    /// reply.
    pub async fn handle_message(
        self: &Arc<Self>,
        message: ControlMessage,
    ) -> Result<Option<ControlMessage>, ErrorRecord> {
        let id = message.delegation_id;
        match message.body {
            ControlBody::Invite(invite) => self.handle_invite(id, invite).await.map(Some),
            ControlBody::Start(start) => self.handle_start(id, start).await.map(|()| None),
            ControlBody::Error(record) => {
                self.handle_peer_error(id, record).await;
                Ok(None)
            }
            ControlBody::Accept(_) => Err(ErrorRecord::new(
                ErrorCode::Declined,
                "unexpected ACCEPT at the executor",
            )),
        }
    }

    /// Admit an INVITE: concurrency, auth, transport availability, work
    /// path allocation; answer with ACCEPT.
    async fn handle_invite(
        self: &Arc<Self>,
        id: Uuid,
        invite: InviteBody,
    ) -> Result<ControlMessage, ErrorRecord> {
        // Duplicate id: replay the ACCEPT while still pending, refuse
        // otherwise.
        if let Some(entry) = self.entry(id) {
            let guard = entry.lock().await;
            if guard.state == AssignmentState::Pending {
                info!(delegation_id = %id, "duplicate INVITE; replaying ACCEPT");
                return Ok(self.accept_message(&guard));
            }
            return Err(ErrorRecord::new(
                ErrorCode::Declined,
                format!("delegation {id} already exists in state {}", guard.state),
            ));
        }

        self.policy
            .check(&invite, self.active.load(Ordering::SeqCst))?;

        let transport = invite.requirements.transport;
        if !self.transports.supports(transport) {
            return Err(ErrorRecord::new(
                ErrorCode::DependencyMissing,
                format!("transport '{transport}' is not available on this executor"),
            )
            .with_hint("use the archive transport"));
        }

        let work_path = self.workspaces.allocate(id)?;
        let assignment = Assignment::new(id, invite, work_path);
        self.store.save(&assignment).map_err(|err| {
            ErrorRecord::new(
                ErrorCode::TransportError,
                format!("failed to persist assignment: {err}"),
            )
        })?;

        let accept = self.accept_message(&assignment);
        {
            let mut map = self
                .assignments
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.insert(id, Arc::new(Mutex::new(assignment)));
        }
        self.channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, Arc::new(EventChannel::new()));
        self.cancels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, CancellationToken::new());
        self.active.fetch_add(1, Ordering::SeqCst);

        info!(delegation_id = %id, "assignment accepted");
        Ok(accept)
    }

    fn accept_message(&self, assignment: &Assignment) -> ControlMessage {
        ControlMessage::new(
            assignment.id,
            ControlBody::Accept(AcceptBody {
                executor_work_dir: ExecutorWorkDir {
                    path: assignment.work_path.clone(),
                },
                executor_constraints: self.constraints(assignment.invite.lease.access_mode),
            }),
        )
    }

    /// Activate an assignment and launch the background run task.
    async fn handle_start(self: &Arc<Self>, id: Uuid, start: StartBody) -> Result<(), ErrorRecord> {
        let entry = self
            .entry(id)
            .ok_or_else(|| ErrorRecord::new(ErrorCode::NotFound, format!("unknown delegation {id}")))?;

        {
            let mut guard = entry.lock().await;
            match guard.apply(AssignmentEvent::ReceiveStart) {
                Ok(_) => {}
                Err(_) if guard.state == AssignmentState::Active => {
                    // Duplicate START; the run is already underway.
                    return Ok(());
                }
                Err(_) => {
                    return Err(ErrorRecord::new(
                        ErrorCode::Declined,
                        format!("START not valid in state {}", guard.state),
                    ));
                }
            }
            guard.active_lease = Some(start.lease);
            self.persist(&guard);
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.run_assignment(id, start.work_dir).await;
        });
        Ok(())
    }

    /// The per-assignment run: transport setup, status, task, snapshot,
    /// terminal event, release.
    async fn run_assignment(self: &Arc<Self>, id: Uuid, handle: TransportHandle) {
        let Some(entry) = self.entry(id) else {
            return;
        };
        let Some(channel) = self.channel(id) else {
            return;
        };
        let token = self.token(id).unwrap_or_default();

        let (work_path, invite) = {
            let guard = entry.lock().await;
            (guard.work_path.clone(), guard.invite.clone())
        };

        // Transport setup; failures become error events, never unwinds.
        let adapter = match self.transports.get(handle.kind()) {
            Ok(adapter) => adapter,
            Err(err) => {
                self.finish_failure(&entry, &channel, err.to_error_record())
                    .await;
                return;
            }
        };
        if let Err(err) = self.workspaces.prepare(&work_path) {
            self.finish_failure(
                &entry,
                &channel,
                ErrorRecord::new(ErrorCode::TransportError, format!("workspace prepare failed: {err}")),
            )
            .await;
            return;
        }
        let effective_path = match adapter
            .setup(SetupRequest {
                delegation_id: id,
                handle,
                work_path: work_path.clone(),
            })
            .await
        {
            Ok(path) => path,
            Err(err) => {
                self.finish_failure(&entry, &channel, err.to_error_record())
                    .await;
                return;
            }
        };

        // Nothing is emitted before this first status event.
        channel.emit(TaskEvent::Status {
            status: TaskStatus::Running,
            message: Some("task started".into()),
        });

        let ctx = TaskContext {
            delegation_id: id,
            work_path: effective_path.clone(),
            task: invite.task.clone(),
            resources: invite.environment.resources.clone(),
            cancel: token.clone(),
        };

        let outcome = tokio::select! {
            outcome = self.task_executor.execute(ctx) => outcome,
            () = token.cancelled() => {
                // The cancel path emits the terminal event and releases.
                debug!(delegation_id = %id, "task aborted by cancellation");
                return;
            }
        };

        match outcome {
            Ok(result) => {
                // Snapshot (when the transport supports one) precedes done.
                let mut snapshot_ids = Vec::new();
                if adapter.capabilities().supports_snapshots {
                    match adapter
                        .capture_snapshot(CaptureRequest {
                            delegation_id: id,
                            work_path: effective_path.clone(),
                        })
                        .await
                    {
                        Ok(Some(captured)) => {
                            let snapshot_id = new_snapshot_id();
                            channel.emit(TaskEvent::Snapshot {
                                snapshot_id: snapshot_id.clone(),
                                summary: result.summary.clone(),
                                highlights: result.highlights.clone(),
                                snapshot_base64: BASE64.encode(&captured.bytes),
                                metadata: Some(captured.metadata),
                                recommended: true,
                            });
                            snapshot_ids.push(snapshot_id);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            self.finish_failure(&entry, &channel, err.to_error_record())
                                .await;
                            return;
                        }
                    }
                }

                let mut guard = entry.lock().await;
                if guard.apply(AssignmentEvent::TaskComplete).is_err() {
                    return;
                }
                guard.result = Some(TaskResult {
                    summary: result.summary.clone(),
                    highlights: result.highlights.clone(),
                    snapshot_ids: snapshot_ids.clone(),
                });
                self.persist(&guard);
                self.active.fetch_sub(1, Ordering::SeqCst);
                drop(guard);

                channel.emit(TaskEvent::Done {
                    summary: result.summary,
                    highlights: result.highlights,
                    recommended_snapshot_id: snapshot_ids.first().cloned(),
                    snapshot_ids,
                });
                info!(delegation_id = %id, "assignment completed");
                self.release(id, &entry).await;
            }
            Err(task_err) => {
                let mut record = ErrorRecord::new(ErrorCode::TaskFailed, task_err.message);
                record.hint = task_err.hint;
                self.finish_failure(&entry, &channel, record).await;
            }
        }
    }

    /// Drive an assignment into `error`, emit the terminal event, and
    /// release its resources.
    async fn finish_failure(
        self: &Arc<Self>,
        entry: &Entry,
        channel: &EventChannel,
        record: ErrorRecord,
    ) {
        let id = {
            let mut guard = entry.lock().await;
            if guard.is_terminal() {
                return;
            }
            warn!(delegation_id = %guard.id, code = %record.code, "assignment failed");
            let event = if guard.state == AssignmentState::Active {
                AssignmentEvent::TaskFail
            } else {
                AssignmentEvent::ReceiveError
            };
            let _ = guard.apply(event);
            guard.error = Some(record.clone());
            self.persist(&guard);
            self.active.fetch_sub(1, Ordering::SeqCst);
            guard.id
        };
        channel.emit(TaskEvent::Error(record));
        self.release(id, entry).await;
    }

    /// Release transport and workspace state for an assignment.
    async fn release(&self, id: Uuid, entry: &Entry) {
        let (work_path, transport) = {
            let guard = entry.lock().await;
            (guard.work_path.clone(), guard.invite.requirements.transport)
        };
        if let Ok(adapter) = self.transports.get(transport) {
            if let Err(err) = adapter.release(id, &work_path).await {
                warn!(delegation_id = %id, error = %err, "transport release failed");
            }
        }
        if let Err(err) = self.workspaces.release(id) {
            warn!(delegation_id = %id, error = %err, "workspace release failed");
        }
    }

    /// A peer-originated ERROR aborts the assignment.
    async fn handle_peer_error(self: &Arc<Self>, id: Uuid, record: ErrorRecord) {
        let Some(entry) = self.entry(id) else {
            return;
        };
        let Some(channel) = self.channel(id) else {
            return;
        };
        if let Some(token) = self.token(id) {
            token.cancel();
        }
        self.finish_failure(&entry, &channel, record).await;
    }

    // -----------------------------------------------------------------------
    // Cancel / ack / subscribe
    // -----------------------------------------------------------------------

    /// Cancel an assignment. Idempotent; returns `false` for unknown ids.
    pub async fn cancel(self: &Arc<Self>, id: Uuid) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        let Some(channel) = self.channel(id) else {
            return false;
        };

        {
            let mut guard = entry.lock().await;
            if guard.is_terminal() {
                return true;
            }
            info!(delegation_id = %id, "cancelling assignment");
            let _ = guard.apply(AssignmentEvent::Cancel);
            guard.error = Some(ErrorRecord::cancelled());
            self.persist(&guard);
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        if let Some(token) = self.token(id) {
            token.cancel();
        }
        channel.emit(TaskEvent::Error(ErrorRecord::cancelled()));
        self.release(id, &entry).await;
        true
    }

    /// Acknowledge a delivered terminal result: the persisted record can
    /// be discarded. Unknown ids succeed (idempotent).
    pub async fn acknowledge(&self, id: Uuid) {
        if let Some(entry) = self.entry(id) {
            let guard = entry.lock().await;
            if guard.is_terminal() {
                if let Err(err) = self.store.delete(id) {
                    warn!(delegation_id = %id, error = %err, "failed to drop acked record");
                }
                debug!(delegation_id = %id, "result acknowledged");
            }
        }
    }

    /// Subscribe to an assignment's event stream.
    pub async fn subscribe(&self, id: Uuid) -> SubscribeOutcome {
        let Some(channel) = self.channel(id) else {
            return SubscribeOutcome::NotFound(TaskEvent::Error(
                ErrorRecord::new(ErrorCode::NotFound, format!("unknown delegation {id}"))
                    .with_hint("the assignment may have been acknowledged and swept"),
            ));
        };

        match channel.subscribe() {
            Subscription::Replay(event) => SubscribeOutcome::Replay(event),
            Subscription::Live(rx) => {
                // A channel created by recovery has no latch; synthesize
                // the terminal event from the persisted record.
                if let Some(entry) = self.entry(id) {
                    let guard = entry.lock().await;
                    if guard.is_terminal() {
                        return SubscribeOutcome::Replay(terminal_event_for(&guard));
                    }
                }
                SubscribeOutcome::Live(rx)
            }
        }
    }

    /// Snapshot of one assignment record (tests and diagnostics).
    pub async fn get(&self, id: Uuid) -> Option<Assignment> {
        let entry = self.entry(id)?;
        Some(entry.lock().await.clone())
    }

    // -----------------------------------------------------------------------
    // Recovery and sweep
    // -----------------------------------------------------------------------

    /// Reload persisted assignments after a restart. Non-terminal
    /// assignments are cancelled (their tasks died with the process) and
    /// their workspaces released; stale work directories are removed.
    ///
    /// # Errors
    ///
    /// Fails only if the record directory cannot be listed.
    pub async fn recover(self: &Arc<Self>) -> anyhow::Result<usize> {
        let records = self.store.load_all()?;
        let mut known = HashSet::new();
        let mut interrupted = Vec::new();

        for record in records {
            known.insert(record.id);
            if !record.is_terminal() {
                interrupted.push(record.id);
                self.active.fetch_add(1, Ordering::SeqCst);
            }
            let id = record.id;
            self.assignments
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(id, Arc::new(Mutex::new(record)));
            self.channels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(id, Arc::new(EventChannel::new()));
            self.cancels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(id, CancellationToken::new());
        }

        let loaded = known.len();
        for id in interrupted {
            info!(delegation_id = %id, "cancelling assignment interrupted by restart");
            self.cancel(id).await;
        }
        self.workspaces.cleanup_stale(&known);

        info!(loaded, "executor state recovered");
        Ok(loaded)
    }

    /// One pass of the periodic sweep: lease expiry, record retention,
    /// stale chunk transfers, orphan work directories.
    pub async fn sweep_once(self: &Arc<Self>) {
        let now = Utc::now();
        let ids: Vec<Uuid> = {
            self.assignments
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .keys()
                .copied()
                .collect()
        };

        let retention = ChronoDuration::seconds(self.config.retention_secs as i64);
        let mut to_remove = Vec::new();
        for id in ids {
            let Some(entry) = self.entry(id) else { continue };
            let (terminal, lease_expired, expired_record) = {
                let guard = entry.lock().await;
                (
                    guard.is_terminal(),
                    guard.active_lease.is_some_and(|l| l.is_expired(now)),
                    guard.updated_at + retention < now,
                )
            };

            if !terminal && lease_expired {
                info!(delegation_id = %id, "assignment lease expired");
                self.cancel(id).await;
                continue;
            }
            if terminal && expired_record {
                to_remove.push(id);
            }
        }

        for id in &to_remove {
            if let Err(err) = self.store.delete(*id) {
                warn!(delegation_id = %id, error = %err, "failed to delete assignment record");
            }
            let _ = self.workspaces.release(*id);
            self.assignments
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(id);
            self.channels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(id);
            self.cancels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(id);
        }

        self.chunks
            .sweep(Duration::from_secs(self.config.chunk_timeout_secs));

        let known: HashSet<Uuid> = {
            self.assignments
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .keys()
                .copied()
                .collect()
        };
        self.workspaces.cleanup_stale(&known);
    }

    /// The configured sweep interval.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.config.sweep_interval_secs)
    }
}

/// Build the terminal event implied by a terminal assignment record.
fn terminal_event_for(assignment: &Assignment) -> TaskEvent {
    if let Some(result) = &assignment.result {
        TaskEvent::Done {
            summary: result.summary.clone(),
            highlights: result.highlights.clone(),
            snapshot_ids: result.snapshot_ids.clone(),
            recommended_snapshot_id: result.snapshot_ids.first().cloned(),
        }
    } else {
        TaskEvent::Error(
            assignment
                .error
                .clone()
                .unwrap_or_else(ErrorRecord::cancelled),
        )
    }
}
