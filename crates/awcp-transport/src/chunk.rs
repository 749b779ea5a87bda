// SPDX-License-Identifier: MIT OR Apache-2.0
//! Executor-side assembly state for chunked archive uploads.
//!
//! The delegator uploads numbered chunks (each with its own SHA-256) and
//! finishes with a completion call carrying the total checksum. Transport
//! setup blocks on [`ChunkStore::wait_assembled`] until the transfer
//! completes or times out. Stale, never-completed transfers are dropped
//! by the executor's cleanup sweep.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::TransportError;
use crate::archive::sha256_hex;

struct ChunkState {
    chunks: BTreeMap<u32, Vec<u8>>,
    total_sha256: Option<String>,
    updated_at: DateTime<Utc>,
}

impl ChunkState {
    fn new() -> Self {
        Self {
            chunks: BTreeMap::new(),
            total_sha256: None,
            updated_at: Utc::now(),
        }
    }
}

/// Transfer progress reported by the chunk status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStatus {
    /// Chunks received so far.
    pub received: u32,
    /// The completion call has arrived.
    pub completed: bool,
}

/// In-memory assembly state for all in-flight chunked transfers.
#[derive(Default)]
pub struct ChunkStore {
    inner: Mutex<HashMap<Uuid, ChunkState>>,
    notify: Notify,
}

impl ChunkStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ChunkState>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Accept one uploaded chunk after verifying its checksum.
    ///
    /// Re-uploading an index overwrites the previous bytes, which makes
    /// chunk upload retries idempotent.
    ///
    /// # Errors
    ///
    /// [`TransportError::ChecksumMismatch`] when the per-chunk digest
    /// disagrees with the payload.
    pub fn put(
        &self,
        delegation_id: Uuid,
        index: u32,
        bytes: Vec<u8>,
        sha256: &str,
    ) -> Result<(), TransportError> {
        let actual = sha256_hex(&bytes);
        if actual != sha256 {
            return Err(TransportError::ChecksumMismatch {
                expected: sha256.to_string(),
                actual,
            });
        }
        {
            let mut guard = self.lock();
            let state = guard.entry(delegation_id).or_insert_with(ChunkState::new);
            state.chunks.insert(index, bytes);
            state.updated_at = Utc::now();
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Record the completion call carrying the total checksum.
    pub fn complete(&self, delegation_id: Uuid, total_sha256: &str) {
        {
            let mut guard = self.lock();
            let state = guard.entry(delegation_id).or_insert_with(ChunkState::new);
            state.total_sha256 = Some(total_sha256.to_string());
            state.updated_at = Utc::now();
        }
        self.notify.notify_waiters();
    }

    /// Progress for the status endpoint; `None` for unknown transfers.
    #[must_use]
    pub fn status(&self, delegation_id: Uuid) -> Option<ChunkStatus> {
        let guard = self.lock();
        guard.get(&delegation_id).map(|state| ChunkStatus {
            received: state.chunks.len() as u32,
            completed: state.total_sha256.is_some(),
        })
    }

    /// Block until the transfer for `delegation_id` completes, then
    /// assemble and checksum-verify the archive.
    ///
    /// # Errors
    ///
    /// - [`TransportError::ChunkTimeout`] if completion does not arrive
    ///   within `timeout`.
    /// - [`TransportError::ChunkIncomplete`] if completion arrived with
    ///   chunks missing.
    /// - [`TransportError::ChecksumMismatch`] if the assembled bytes do
    ///   not match the announced total checksum.
    pub async fn wait_assembled(
        &self,
        delegation_id: Uuid,
        expected_count: u32,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let assemble = async {
            loop {
                let notified = self.notify.notified();
                if let Some(result) = self.try_assemble(delegation_id, expected_count) {
                    return result;
                }
                // Re-check periodically: a notification between the check
                // above and this await would otherwise be missed.
                let _ = tokio::time::timeout(Duration::from_millis(100), notified).await;
            }
        };
        tokio::time::timeout(timeout, assemble)
            .await
            .map_err(|_| TransportError::ChunkTimeout)?
    }

    /// Attempt assembly; `None` while the completion call is outstanding.
    fn try_assemble(
        &self,
        delegation_id: Uuid,
        expected_count: u32,
    ) -> Option<Result<Vec<u8>, TransportError>> {
        let guard = self.lock();
        let state = guard.get(&delegation_id)?;
        let total_sha256 = state.total_sha256.clone()?;

        let received = state.chunks.len() as u32;
        if received != expected_count {
            return Some(Err(TransportError::ChunkIncomplete {
                received,
                expected: expected_count,
            }));
        }

        let mut bytes = Vec::new();
        for chunk in state.chunks.values() {
            bytes.extend_from_slice(chunk);
        }
        let actual = sha256_hex(&bytes);
        if actual != total_sha256 {
            return Some(Err(TransportError::ChecksumMismatch {
                expected: total_sha256,
                actual,
            }));
        }
        Some(Ok(bytes))
    }

    /// Drop all state for a delegation. Idempotent.
    pub fn remove(&self, delegation_id: Uuid) {
        self.lock().remove(&delegation_id);
    }

    /// Drop transfers idle for longer than `max_age`; returns how many
    /// were removed.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut guard = self.lock();
        let before = guard.len();
        guard.retain(|_, state| state.updated_at > cutoff);
        before - guard.len()
    }
}
