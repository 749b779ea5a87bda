// SPDX-License-Identifier: MIT OR Apache-2.0
//! Scriptable in-memory transport for tests.
//!
//! Plays the role of any transport kind with whatever capabilities a
//! test needs: live-sync policy coercion, snapshot-free channels, setup
//! failures, and release-exactness counting.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use awcp_core::handle::{
    TransportCapabilities, TransportCredential, TransportHandle, TransportKind,
};

use crate::{
    ApplySnapshotRequest, CaptureRequest, CapturedSnapshot, DelegatorTransport, ExecutorTransport,
    PrepareRequest, SetupRequest, TransportError,
};

/// A transport whose behavior is chosen by the test.
pub struct ScriptedTransport {
    kind: TransportKind,
    capabilities: TransportCapabilities,
    fail_setup: bool,
    snapshot_bytes: Mutex<Option<Vec<u8>>>,
    release_count: AtomicUsize,
    applied: Mutex<Vec<Uuid>>,
}

impl ScriptedTransport {
    /// A mount-flavored transport with `live_sync = true`.
    #[must_use]
    pub fn live_sync() -> Self {
        Self {
            kind: TransportKind::Mount,
            capabilities: TransportCapabilities {
                live_sync: true,
                supports_snapshots: false,
                chunked: false,
            },
            fail_setup: false,
            snapshot_bytes: Mutex::new(None),
            release_count: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
        }
    }

    /// An archive-flavored transport that snapshots the given bytes.
    #[must_use]
    pub fn snapshotting(bytes: Vec<u8>) -> Self {
        Self {
            kind: TransportKind::Archive,
            capabilities: TransportCapabilities {
                live_sync: false,
                supports_snapshots: true,
                chunked: false,
            },
            fail_setup: false,
            snapshot_bytes: Mutex::new(Some(bytes)),
            release_count: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
        }
    }

    /// A transport whose `setup` always fails.
    #[must_use]
    pub fn failing_setup() -> Self {
        Self {
            fail_setup: true,
            ..Self::live_sync()
        }
    }

    /// How many times `release` has been called, across both roles.
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.release_count.load(Ordering::SeqCst)
    }

    /// Delegation ids whose snapshots were applied.
    #[must_use]
    pub fn applied_ids(&self) -> Vec<Uuid> {
        self.applied
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn dummy_handle(&self) -> TransportHandle {
        TransportHandle::Mount {
            endpoint: "scripted:0".into(),
            export: "/env".into(),
            credential: TransportCredential {
                secret: "scripted-secret".into(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            },
        }
    }
}

#[async_trait]
impl DelegatorTransport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn capabilities(&self) -> TransportCapabilities {
        self.capabilities
    }

    async fn prepare(&self, _req: PrepareRequest) -> Result<TransportHandle, TransportError> {
        Ok(self.dummy_handle())
    }

    async fn apply_snapshot(&self, req: ApplySnapshotRequest) -> Result<(), TransportError> {
        self.applied
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(req.delegation_id);
        Ok(())
    }

    async fn release(&self, _delegation_id: Uuid) -> Result<(), TransportError> {
        self.release_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ExecutorTransport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn capabilities(&self) -> TransportCapabilities {
        self.capabilities
    }

    async fn setup(&self, req: SetupRequest) -> Result<PathBuf, TransportError> {
        if self.fail_setup {
            return Err(TransportError::Archive("scripted setup failure".into()));
        }
        std::fs::create_dir_all(&req.work_path)?;
        Ok(req.work_path)
    }

    async fn capture_snapshot(
        &self,
        _req: CaptureRequest,
    ) -> Result<Option<CapturedSnapshot>, TransportError> {
        let bytes = self
            .snapshot_bytes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        Ok(bytes.map(|bytes| CapturedSnapshot {
            metadata: awcp_core::SnapshotMetadata {
                file_count: 1,
                total_bytes: bytes.len() as u64,
            },
            bytes,
        }))
    }

    async fn release(&self, _delegation_id: Uuid, _work_path: &Path) -> Result<(), TransportError> {
        self.release_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
