// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transport adapters: the pluggable data plane of AWCP.
//!
//! A transport is two parallel interfaces — one per protocol side — plus a
//! capability struct. The delegator side turns a materialized environment
//! into an opaque [`TransportHandle`]; the executor side turns that handle
//! into a populated work directory and, if supported, captures a snapshot
//! archive on the way back. Dispatch happens by the handle discriminator;
//! unknown kinds are a transport error, never a panic.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Archive (tar.gz) transport: pack, ship, unpack, snapshot back.
pub mod archive;
/// Executor-side assembly state for chunked archive uploads.
pub mod chunk;
/// Scriptable in-memory transport for tests.
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use awcp_core::error::{ErrorCode, ErrorRecord};
use awcp_core::handle::{TransportCapabilities, TransportHandle, TransportKind};
use awcp_core::{ResourceSpec, SnapshotMetadata};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures inside a transport adapter.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No adapter is registered for the requested kind.
    #[error("no transport registered for kind '{kind}'")]
    UnknownTransport {
        /// The requested kind.
        kind: TransportKind,
    },

    /// A handle of the wrong kind was dispatched to this adapter.
    #[error("handle kind '{actual}' does not match adapter '{expected}'")]
    HandleMismatch {
        /// The adapter's kind.
        expected: TransportKind,
        /// The handle's kind.
        actual: TransportKind,
    },

    /// An archive checksum did not match its payload.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Checksum announced by the sender.
        expected: String,
        /// Checksum computed over the received bytes.
        actual: String,
    },

    /// A chunked transfer ended with chunks missing.
    #[error("chunked transfer incomplete: {received}/{expected} chunks")]
    ChunkIncomplete {
        /// Chunks received so far.
        received: u32,
        /// Chunks announced in the handle.
        expected: u32,
    },

    /// A chunked transfer did not complete within its window.
    #[error("chunked transfer timed out")]
    ChunkTimeout,

    /// A base64 payload could not be decoded.
    #[error("payload decode failed: {0}")]
    Decode(String),

    /// Archive packing or unpacking failed.
    #[error("archive error: {0}")]
    Archive(String),

    /// Underlying IO failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Promote into the protocol-visible error record.
    #[must_use]
    pub fn to_error_record(&self) -> ErrorRecord {
        match self {
            Self::ChecksumMismatch { .. } => {
                ErrorRecord::new(ErrorCode::ChecksumMismatch, self.to_string())
            }
            _ => ErrorRecord::new(ErrorCode::TransportError, self.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Input to [`DelegatorTransport::prepare`].
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    /// Delegation being prepared.
    pub delegation_id: Uuid,
    /// Materialized environment root on the delegator host.
    pub env_root: PathBuf,
    /// Lease lifetime, for transports minting short-lived credentials.
    pub ttl_seconds: u64,
}

/// Input to [`DelegatorTransport::apply_snapshot`].
#[derive(Debug, Clone)]
pub struct ApplySnapshotRequest {
    /// Delegation the snapshot belongs to.
    pub delegation_id: Uuid,
    /// Raw snapshot archive bytes.
    pub snapshot_bytes: Vec<u8>,
    /// The delegation's resources; only `rw` entries may be written.
    pub resources: Vec<ResourceSpec>,
}

/// Input to [`ExecutorTransport::setup`].
#[derive(Debug, Clone)]
pub struct SetupRequest {
    /// Assignment being set up.
    pub delegation_id: Uuid,
    /// Handle received in START.
    pub handle: TransportHandle,
    /// Allocated (empty) work directory.
    pub work_path: PathBuf,
}

/// Input to [`ExecutorTransport::capture_snapshot`].
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    /// Assignment being captured.
    pub delegation_id: Uuid,
    /// The work directory to archive.
    pub work_path: PathBuf,
}

/// A snapshot archive captured by the executor side.
#[derive(Debug, Clone)]
pub struct CapturedSnapshot {
    /// Raw archive bytes.
    pub bytes: Vec<u8>,
    /// Size statistics for the archived tree.
    pub metadata: SnapshotMetadata,
}

/// One chunk the delegator must upload before the executor can assemble
/// a chunked handle.
#[derive(Debug, Clone)]
pub struct OutboundChunk {
    /// Zero-based chunk index.
    pub index: u32,
    /// Chunk payload.
    pub bytes: Vec<u8>,
    /// Hex SHA-256 of this chunk.
    pub sha256: String,
}

// ---------------------------------------------------------------------------
// Adapter traits
// ---------------------------------------------------------------------------

/// Delegator-side transport operations.
#[async_trait]
pub trait DelegatorTransport: Send + Sync {
    /// The kind this adapter serves.
    fn kind(&self) -> TransportKind;

    /// Capability flags of the data channel.
    fn capabilities(&self) -> TransportCapabilities;

    /// Turn a materialized environment into a handle the executor can use.
    async fn prepare(&self, req: PrepareRequest) -> Result<TransportHandle, TransportError>;

    /// Chunks that must be uploaded after `prepare` returned a chunked
    /// handle. Empty for inline handles and non-chunked transports.
    async fn outbound_chunks(
        &self,
        _delegation_id: Uuid,
    ) -> Result<Vec<OutboundChunk>, TransportError> {
        Ok(Vec::new())
    }

    /// Apply a snapshot archive to the delegation's `rw` resources.
    ///
    /// Required iff `capabilities().supports_snapshots`.
    async fn apply_snapshot(&self, req: ApplySnapshotRequest) -> Result<(), TransportError>;

    /// Release any per-delegation state (credentials, staged bytes).
    /// Must be idempotent.
    async fn release(&self, delegation_id: Uuid) -> Result<(), TransportError>;

    /// Detach without releasing remote state (crash-recovery path).
    async fn detach(&self, _delegation_id: Uuid) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Executor-side transport operations.
#[async_trait]
pub trait ExecutorTransport: Send + Sync {
    /// The kind this adapter serves.
    fn kind(&self) -> TransportKind;

    /// Capability flags of the data channel.
    fn capabilities(&self) -> TransportCapabilities;

    /// Materialize the handle's contents into `work_path`; returns the
    /// effective work path handed to the task executor.
    async fn setup(&self, req: SetupRequest) -> Result<PathBuf, TransportError>;

    /// Capture a point-in-time archive of the work directory.
    ///
    /// Returns `None` for transports without snapshot support.
    async fn capture_snapshot(
        &self,
        req: CaptureRequest,
    ) -> Result<Option<CapturedSnapshot>, TransportError>;

    /// Release per-assignment state. Must be idempotent.
    async fn release(&self, delegation_id: Uuid, work_path: &Path) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

/// Kind-keyed registry of delegator-side adapters.
#[derive(Default)]
pub struct DelegatorTransportRegistry {
    adapters: BTreeMap<TransportKind, Arc<dyn DelegatorTransport>>,
}

impl DelegatorTransportRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn DelegatorTransport>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Look up the adapter for `kind`.
    ///
    /// # Errors
    ///
    /// [`TransportError::UnknownTransport`] when nothing is registered.
    pub fn get(&self, kind: TransportKind) -> Result<Arc<dyn DelegatorTransport>, TransportError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or(TransportError::UnknownTransport { kind })
    }

    /// Kinds with a registered adapter.
    #[must_use]
    pub fn kinds(&self) -> Vec<TransportKind> {
        self.adapters.keys().copied().collect()
    }
}

/// Kind-keyed registry of executor-side adapters.
#[derive(Default)]
pub struct ExecutorTransportRegistry {
    adapters: BTreeMap<TransportKind, Arc<dyn ExecutorTransport>>,
}

impl ExecutorTransportRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ExecutorTransport>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Look up the adapter for `kind`.
    ///
    /// # Errors
    ///
    /// [`TransportError::UnknownTransport`] when nothing is registered.
    pub fn get(&self, kind: TransportKind) -> Result<Arc<dyn ExecutorTransport>, TransportError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or(TransportError::UnknownTransport { kind })
    }

    /// Returns `true` when an adapter is registered for `kind`.
    #[must_use]
    pub fn supports(&self, kind: TransportKind) -> bool {
        self.adapters.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveExecutorTransport;

    #[test]
    fn unknown_kind_is_a_transport_error() {
        let registry = ExecutorTransportRegistry::new();
        let err = match registry.get(TransportKind::Mount) {
            Err(e) => e,
            Ok(_) => panic!("expected TransportError::UnknownTransport"),
        };
        assert!(matches!(
            err,
            TransportError::UnknownTransport {
                kind: TransportKind::Mount
            }
        ));
        assert_eq!(
            err.to_error_record().code,
            awcp_core::error::ErrorCode::TransportError
        );
    }

    #[test]
    fn checksum_mismatch_maps_to_its_own_code() {
        let err = TransportError::ChecksumMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(
            err.to_error_record().code,
            awcp_core::error::ErrorCode::ChecksumMismatch
        );
    }

    #[test]
    fn registry_roundtrip() {
        let mut registry = ExecutorTransportRegistry::new();
        registry.register(Arc::new(ArchiveExecutorTransport::default()));
        assert!(registry.supports(TransportKind::Archive));
        assert!(!registry.supports(TransportKind::Branch));
        assert!(registry.get(TransportKind::Archive).is_ok());
    }
}
