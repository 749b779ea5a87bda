// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scenarios: a real delegator service against a real executor
//! daemon over loopback HTTP.

use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event as SseEvent, Sse};
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get, routing::post};
use futures::future::BoxFuture;
use serde_json::json;
use tokio::task::JoinHandle;
use uuid::Uuid;

use awcp_config::{AdmissionLimits, DelegatorConfig, ExecutorConfig};
use awcp_core::error::ErrorCode;
use awcp_core::handle::TransportKind;
use awcp_core::message::{AcceptBody, ControlBody, ControlMessage};
use awcp_core::state::{DelegationEvent, DelegationState};
use awcp_core::{
    AccessMode, Delegation, ExecutorConstraints, ExecutorWorkDir, LeaseConfig, ResourceKind,
    ResourceSpec, SandboxProfile, SnapshotPolicy, SnapshotSettings, SnapshotStatus, TaskSpec,
};
use awcp_delegator::persist::DelegationStore;
use awcp_delegator::service::{DelegateError, DelegateParams, DelegatorService};
use awcp_executor::service::{ExecutorService, SubscribeOutcome};
use awcp_executor::task::{FnTaskExecutor, TaskContext, TaskError, TaskExecutor, TaskOutcome};
use awcp_transport::archive::{ArchiveDelegatorTransport, ArchiveExecutorTransport};
use awcp_transport::chunk::ChunkStore;
use awcp_transport::{DelegatorTransportRegistry, ExecutorTransportRegistry};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct ExecutorFixture {
    url: String,
    service: Arc<ExecutorService>,
    _work_dir: tempfile::TempDir,
    server: JoinHandle<()>,
}

impl Drop for ExecutorFixture {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn spawn_executor(task_executor: Arc<dyn TaskExecutor>) -> ExecutorFixture {
    let work_dir = tempfile::tempdir().unwrap();
    let config = ExecutorConfig {
        work_dir: work_dir.path().to_path_buf(),
        ..ExecutorConfig::default()
    };
    let chunks = Arc::new(ChunkStore::new());
    let mut transports = ExecutorTransportRegistry::new();
    transports.register(Arc::new(ArchiveExecutorTransport::new(
        Arc::clone(&chunks),
        Duration::from_secs(30),
    )));
    let service = ExecutorService::new(config, transports, chunks, task_executor).unwrap();

    let app = awcp_executor::build_app(awcp_executor::AppState {
        service: Arc::clone(&service),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    ExecutorFixture {
        url,
        service,
        _work_dir: work_dir,
        server,
    }
}

fn delegator_with(base_dir: &Path, config: DelegatorConfig) -> Arc<DelegatorService> {
    let config = DelegatorConfig {
        base_dir: base_dir.to_path_buf(),
        ..config
    };
    let mut transports = DelegatorTransportRegistry::new();
    transports.register(Arc::new(ArchiveDelegatorTransport::default()));
    DelegatorService::new(config, transports).unwrap()
}

fn appender() -> Arc<dyn TaskExecutor> {
    Arc::new(FnTaskExecutor::new(|ctx: TaskContext| {
        Box::pin(async move {
            let path = ctx.work_path.join("ws/a.txt");
            let mut contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| TaskError::new(format!("read a.txt: {e}")))?;
            contents.push('!');
            tokio::fs::write(&path, contents)
                .await
                .map_err(|e| TaskError::new(format!("write a.txt: {e}")))?;
            Ok(TaskOutcome {
                summary: "appended ! to a.txt".into(),
                highlights: vec!["ws/a.txt".into()],
            })
        }) as BoxFuture<'static, Result<TaskOutcome, TaskError>>
    }))
}

fn hanging() -> Arc<dyn TaskExecutor> {
    Arc::new(FnTaskExecutor::new(|ctx: TaskContext| {
        Box::pin(async move {
            ctx.cancel.cancelled().await;
            Err(TaskError::new("aborted"))
        }) as BoxFuture<'static, Result<TaskOutcome, TaskError>>
    }))
}

fn params(executor_url: &str, source: &Path, policy: SnapshotPolicy) -> DelegateParams {
    DelegateParams {
        executor_url: executor_url.to_string(),
        task: TaskSpec {
            description: "append".into(),
            prompt: "append ! to a.txt".into(),
        },
        resources: vec![ResourceSpec {
            name: "ws".into(),
            kind: ResourceKind::Directory,
            source: source.to_path_buf(),
            mode: AccessMode::Rw,
        }],
        ttl_seconds: Some(60),
        access_mode: Some(AccessMode::Rw),
        snapshot_policy: Some(policy),
        transport: Some(TransportKind::Archive),
        auth: None,
    }
}

async fn wait_for_state(
    service: &Arc<DelegatorService>,
    id: Uuid,
    predicate: impl Fn(DelegationState) -> bool,
) -> DelegationState {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let state = service.get(id).await.expect("delegation exists").state;
        if predicate(state) {
            return state;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting; last state {state}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------
// S1 — archive happy path with auto-apply
// ---------------------------------------------------------------------------

#[tokio::test]
async fn archive_happy_path_applies_changes_to_the_source() {
    let executor = spawn_executor(appender()).await;
    let base = tempfile::tempdir().unwrap();
    let delegator = delegator_with(base.path(), DelegatorConfig::default());

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), "hi").unwrap();

    let id = delegator
        .delegate(params(&executor.url, src.path(), SnapshotPolicy::Auto))
        .await
        .unwrap();
    let state = delegator
        .wait_for_completion(id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(state, DelegationState::Completed);

    // The executor's change flowed back into the source tree.
    assert_eq!(
        std::fs::read_to_string(src.path().join("a.txt")).unwrap(),
        "hi!"
    );

    let record = delegator.get(id).await.unwrap();
    assert_eq!(record.result.as_ref().unwrap().summary, "appended ! to a.txt");
    assert_eq!(record.snapshots.len(), 1);
    assert_eq!(record.snapshots[0].status, SnapshotStatus::Applied);
    assert_eq!(
        record.applied_snapshot_id.as_deref(),
        Some(record.snapshots[0].snapshot_id.as_str())
    );

    // Environment root removed on release.
    assert!(record.env_root.is_none());
    assert!(!base.path().join("environments").join(id.to_string()).exists());
}

// ---------------------------------------------------------------------------
// S1b — chunked archive transfer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chunked_archive_transfer_round_trips() {
    let executor = spawn_executor(appender()).await;
    let base = tempfile::tempdir().unwrap();

    let config = DelegatorConfig {
        base_dir: base.path().to_path_buf(),
        ..DelegatorConfig::default()
    };
    let mut transports = DelegatorTransportRegistry::new();
    // Force chunking with a tiny inline limit.
    transports.register(Arc::new(ArchiveDelegatorTransport::new(512, 4 * 1024)));
    let delegator = DelegatorService::new(config, transports).unwrap();

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), "hi").unwrap();
    // Incompressible filler so the packed archive genuinely exceeds the
    // inline limit and takes the chunked path.
    let mut filler = Vec::with_capacity(64 * 1024);
    let mut x: u32 = 0x2545_f491;
    for _ in 0..64 * 1024 {
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        filler.push(x as u8);
    }
    std::fs::write(src.path().join("filler.bin"), filler).unwrap();

    let id = delegator
        .delegate(params(&executor.url, src.path(), SnapshotPolicy::Auto))
        .await
        .unwrap();
    let state = delegator
        .wait_for_completion(id, Duration::from_secs(15))
        .await
        .unwrap();
    assert_eq!(state, DelegationState::Completed);
    assert_eq!(
        std::fs::read_to_string(src.path().join("a.txt")).unwrap(),
        "hi!"
    );
}

// ---------------------------------------------------------------------------
// S2 — admission size rejection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn admission_rejects_oversized_workspace_before_materializing() {
    let executor = spawn_executor(appender()).await;
    let base = tempfile::tempdir().unwrap();
    let config = DelegatorConfig {
        admission: AdmissionLimits {
            max_total_bytes: 1024 * 1024,
            ..AdmissionLimits::default()
        },
        ..DelegatorConfig::default()
    };
    let delegator = delegator_with(base.path(), config);

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("blob.bin"), vec![0u8; 2 * 1024 * 1024]).unwrap();

    let err = delegator
        .delegate(params(&executor.url, src.path(), SnapshotPolicy::Auto))
        .await
        .unwrap_err();
    let DelegateError::Protocol(record) = err else {
        panic!("expected protocol error, got {err:?}");
    };
    assert_eq!(record.code, ErrorCode::WorkspaceTooLarge);
    let hint = record.hint.unwrap();
    assert!(hint.contains("2MB"), "hint: {hint}");
    assert!(hint.contains("1MB"), "hint: {hint}");

    // Nothing was created under the environments tree.
    assert!(!base.path().join("environments").exists());
}

// ---------------------------------------------------------------------------
// S3 — staged snapshot: apply, then discard on a second run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn staged_snapshot_apply_then_discard() {
    let executor = spawn_executor(appender()).await;
    let base = tempfile::tempdir().unwrap();
    let delegator = delegator_with(base.path(), DelegatorConfig::default());

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), "hi").unwrap();

    // First run: snapshot stays pending, environment is retained.
    let id = delegator
        .delegate(params(&executor.url, src.path(), SnapshotPolicy::Staged))
        .await
        .unwrap();
    delegator
        .wait_for_completion(id, Duration::from_secs(10))
        .await
        .unwrap();

    let record = delegator.get(id).await.unwrap();
    assert_eq!(record.state, DelegationState::Completed);
    assert_eq!(record.snapshots.len(), 1);
    assert_eq!(record.snapshots[0].status, SnapshotStatus::Pending);
    let snap_1 = record.snapshots[0].snapshot_id.clone();

    // Source untouched, environment not yet released.
    assert_eq!(std::fs::read_to_string(src.path().join("a.txt")).unwrap(), "hi");
    assert!(record.env_root.is_some());
    assert!(record.snapshots[0]
        .archive_path
        .as_ref()
        .is_some_and(|p| p.exists()));

    // Apply mutates the source and releases the environment.
    delegator.apply_snapshot(id, &snap_1).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(src.path().join("a.txt")).unwrap(),
        "hi!"
    );
    let record = delegator.get(id).await.unwrap();
    assert_eq!(record.snapshots[0].status, SnapshotStatus::Applied);
    assert!(record.env_root.is_none());

    // Second run: discard leaves the source untouched.
    let id2 = delegator
        .delegate(params(&executor.url, src.path(), SnapshotPolicy::Staged))
        .await
        .unwrap();
    delegator
        .wait_for_completion(id2, Duration::from_secs(10))
        .await
        .unwrap();
    let record2 = delegator.get(id2).await.unwrap();
    let snap_2 = record2.snapshots[0].snapshot_id.clone();

    delegator.discard_snapshot(id2, &snap_2).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(src.path().join("a.txt")).unwrap(),
        "hi!"
    );
    let record2 = delegator.get(id2).await.unwrap();
    assert_eq!(record2.snapshots[0].status, SnapshotStatus::Discarded);
    assert!(record2.env_root.is_none());

    // Discard is idempotent.
    delegator.discard_snapshot(id2, &snap_2).await.unwrap();
}

// ---------------------------------------------------------------------------
// S4 — mid-stream SSE failure
// ---------------------------------------------------------------------------

/// A misbehaving executor: accepts INVITE and START, emits one status
/// event, then closes the stream without a terminal event.
async fn spawn_flaky_executor() -> (String, JoinHandle<()>) {
    async fn control(Json(message): Json<ControlMessage>) -> axum::response::Response {
        match &message.body {
            ControlBody::Invite(_) => Json(ControlMessage::new(
                message.delegation_id,
                ControlBody::Accept(AcceptBody {
                    executor_work_dir: ExecutorWorkDir {
                        path: "/tmp/flaky".into(),
                    },
                    executor_constraints: ExecutorConstraints {
                        accepted_access_mode: AccessMode::Rw,
                        max_ttl_seconds: 3600,
                        sandbox_profile: SandboxProfile {
                            cwd_only: true,
                            allow_network: true,
                            allow_exec: true,
                        },
                    },
                }),
            ))
            .into_response(),
            _ => StatusCode::ACCEPTED.into_response(),
        }
    }

    async fn events() -> Sse<futures::stream::Iter<std::vec::IntoIter<Result<SseEvent, Infallible>>>> {
        let frames = vec![Ok(SseEvent::default()
            .data(r#"{"type":"status","status":"running"}"#))];
        Sse::new(futures::stream::iter(frames))
    }

    let app = Router::new()
        .route("/awcp", post(control))
        .route("/awcp/tasks/{id}/events", get(events))
        .route("/awcp/tasks/{id}/ack", post(|| async { Json(json!({"ok": true})) }))
        .route("/awcp/cancel/{id}", post(|| async { Json(json!({"ok": true})) }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (url, server)
}

#[tokio::test]
async fn mid_stream_sse_failure_marks_the_delegation_failed() {
    let (url, server) = spawn_flaky_executor().await;
    let base = tempfile::tempdir().unwrap();
    let delegator = delegator_with(base.path(), DelegatorConfig::default());

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), "hi").unwrap();

    let id = delegator
        .delegate(params(&url, src.path(), SnapshotPolicy::Auto))
        .await
        .unwrap();
    let state = delegator
        .wait_for_completion(id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(state, DelegationState::Error);

    let record = delegator.get(id).await.unwrap();
    let error = record.error.unwrap();
    assert_eq!(error.code, ErrorCode::SseFailed);
    assert!(error.hint.is_some());
    assert!(record.env_root.is_none());

    server.abort();
}

// ---------------------------------------------------------------------------
// S5 — cancel during running
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_during_running_tears_down_both_sides() {
    let executor = spawn_executor(hanging()).await;
    let base = tempfile::tempdir().unwrap();
    let delegator = delegator_with(base.path(), DelegatorConfig::default());

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), "hi").unwrap();

    let id = delegator
        .delegate(params(&executor.url, src.path(), SnapshotPolicy::Auto))
        .await
        .unwrap();
    wait_for_state(&delegator, id, |s| s == DelegationState::Running).await;

    assert!(delegator.cancel(id).await);
    let record = delegator.get(id).await.unwrap();
    assert_eq!(record.state, DelegationState::Cancelled);
    assert_eq!(record.error.unwrap().code, ErrorCode::Cancelled);
    assert!(record.env_root.is_none());

    // Cancel is idempotent on the delegator.
    assert!(delegator.cancel(id).await);

    // The executor saw the cancel, aborted the task, and latches the
    // terminal event for late subscribers.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let assignment = executor.service.get(id).await.unwrap();
        if assignment.is_terminal() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "executor never cancelled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    match executor.service.subscribe(id).await {
        SubscribeOutcome::Replay(event) => assert!(event.is_terminal()),
        _ => panic!("expected terminal replay on the executor"),
    }
}

// ---------------------------------------------------------------------------
// S6 — crash recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn crash_recovery_forces_running_delegations_to_error() {
    let base = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), "hi").unwrap();

    // Persist a delegation stuck in `running`, as a crashed daemon would
    // have left it, plus an orphan environment directory.
    let interrupted = {
        let mut record = Delegation::new(
            awcp_core::new_delegation_id(),
            "http://127.0.0.1:1",
            TaskSpec {
                description: "append".into(),
                prompt: "append ! to a.txt".into(),
            },
            vec![ResourceSpec {
                name: "ws".into(),
                kind: ResourceKind::Directory,
                source: src.path().to_path_buf(),
                mode: AccessMode::Rw,
            }],
            LeaseConfig {
                ttl_seconds: 60,
                access_mode: AccessMode::Rw,
            },
            SnapshotSettings {
                policy: SnapshotPolicy::Auto,
                retention_ms: 60_000,
                max_snapshots: 4,
            },
            TransportKind::Archive,
        );
        for event in [
            DelegationEvent::SendInvite,
            DelegationEvent::ReceiveAccept,
            DelegationEvent::SendStart,
            DelegationEvent::SetupComplete,
        ] {
            record.apply(event).unwrap();
        }
        let env_root = base.path().join("environments").join(record.id.to_string());
        std::fs::create_dir_all(&env_root).unwrap();
        record.env_root = Some(env_root);
        DelegationStore::new(base.path()).save(&record).unwrap();
        record.id
    };
    let orphan = base.path().join("environments").join(Uuid::new_v4().to_string());
    std::fs::create_dir_all(&orphan).unwrap();

    // Restarted daemon recovers the record and removes the orphan.
    let delegator = delegator_with(base.path(), DelegatorConfig::default());
    let loaded = delegator.recover().await.unwrap();
    assert_eq!(loaded, 1);

    let record = delegator.get(interrupted).await.unwrap();
    assert_eq!(record.state, DelegationState::Error);
    assert_eq!(record.error.as_ref().unwrap().code, ErrorCode::SseFailed);
    assert!(record.env_root.is_none());
    assert!(!base
        .path()
        .join("environments")
        .join(interrupted.to_string())
        .exists());
    assert!(!orphan.exists());
}

// ---------------------------------------------------------------------------
// Policy coercion — live-sync transports never stage snapshots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn live_sync_transport_coerces_snapshot_policy_to_auto() {
    let (url, server) = spawn_flaky_executor().await;
    let base = tempfile::tempdir().unwrap();

    let config = DelegatorConfig {
        base_dir: base.path().to_path_buf(),
        ..DelegatorConfig::default()
    };
    let mut transports = DelegatorTransportRegistry::new();
    transports.register(Arc::new(awcp_transport::testing::ScriptedTransport::live_sync()));
    let delegator = DelegatorService::new(config, transports).unwrap();

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), "hi").unwrap();

    let mut p = params(&url, src.path(), SnapshotPolicy::Staged);
    p.transport = Some(TransportKind::Mount);
    let id = delegator.delegate(p).await.unwrap();

    let record = delegator.get(id).await.unwrap();
    assert_eq!(record.snapshot_settings.policy, SnapshotPolicy::Auto);

    delegator.cancel(id).await;
    server.abort();
}
