// SPDX-License-Identifier: MIT OR Apache-2.0
//! The archive transport: a point-in-time tar.gz of the environment.
//!
//! Packing rules (identical on both legs): walk the root with dotfiles
//! included and symlinks dereferenced, exclude `.awcp/**`, write entries
//! in sorted order into a gzip (level 6) compressed tar stream, and hash
//! the finished archive with SHA-256. Small archives ride inline in the
//! handle as base64; large ones are split into fixed-size chunks, each
//! with its own checksum, and assembled on the executor via the chunk
//! endpoints. A checksum mismatch anywhere is fatal for the delegation.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use awcp_core::handle::{ChunkedDescriptor, TransportCapabilities, TransportHandle, TransportKind};
use awcp_core::{AccessMode, SnapshotMetadata};

use crate::chunk::ChunkStore;
use crate::{
    ApplySnapshotRequest, CaptureRequest, CapturedSnapshot, DelegatorTransport, ExecutorTransport,
    OutboundChunk, PrepareRequest, SetupRequest, TransportError,
};

/// Default threshold below which archives ride inline in the handle.
pub const DEFAULT_INLINE_LIMIT: usize = 8 * 1024 * 1024;

/// Default chunk size for chunked transfers.
pub const DEFAULT_CHUNK_BYTES: usize = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Hex SHA-256 of a byte slice.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn exclusion_globs() -> Result<GlobSet, TransportError> {
    let mut b = GlobSetBuilder::new();
    for pattern in [".awcp", ".awcp/**"] {
        b.add(Glob::new(pattern).map_err(|e| TransportError::Archive(e.to_string()))?);
    }
    b.build().map_err(|e| TransportError::Archive(e.to_string()))
}

/// Pack the directory at `root` into a tar.gz archive.
///
/// Dotfiles are included, symlinks are dereferenced, and `.awcp/**` is
/// excluded. Entries are written in sorted order so identical trees
/// produce identical archives. Unreadable children are skipped rather
/// than failing the pack.
///
/// # Errors
///
/// Fails only when the root itself cannot be walked or the archive
/// stream cannot be written.
pub fn pack(root: &Path) -> Result<(Vec<u8>, SnapshotMetadata), TransportError> {
    let exclude = exclusion_globs()?;
    let encoder = GzEncoder::new(Vec::new(), Compression::new(6));
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(true);

    let mut metadata = SnapshotMetadata::default();

    for entry in WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
    {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry during pack");
                continue;
            }
        };
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => continue,
        };
        if exclude.is_match(&rel) {
            continue;
        }

        if entry.file_type().is_dir() {
            builder
                .append_dir(&rel, entry.path())
                .map_err(|e| TransportError::Archive(e.to_string()))?;
        } else if entry.file_type().is_file() {
            metadata.file_count += 1;
            metadata.total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            builder
                .append_path_with_name(entry.path(), &rel)
                .map_err(|e| TransportError::Archive(e.to_string()))?;
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| TransportError::Archive(e.to_string()))?;
    let bytes = encoder
        .finish()
        .map_err(|e| TransportError::Archive(e.to_string()))?;
    Ok((bytes, metadata))
}

/// Unpack a tar.gz archive into `dest`.
///
/// # Errors
///
/// Fails when the payload is not a valid gzip'd tar stream or an entry
/// cannot be written.
pub fn unpack(bytes: &[u8], dest: &Path) -> Result<(), TransportError> {
    std::fs::create_dir_all(dest)?;
    let decoder = GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .map_err(|e| TransportError::Archive(e.to_string()))
}

/// Verify `bytes` against an announced hex SHA-256.
///
/// # Errors
///
/// [`TransportError::ChecksumMismatch`] when the digests disagree.
pub fn verify_checksum(bytes: &[u8], expected: &str) -> Result<(), TransportError> {
    let actual = sha256_hex(bytes);
    if actual != expected {
        return Err(TransportError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Split an archive into fixed-size chunks with per-chunk checksums.
#[must_use]
pub fn split_chunks(bytes: &[u8], chunk_bytes: usize) -> Vec<OutboundChunk> {
    bytes
        .chunks(chunk_bytes.max(1))
        .enumerate()
        .map(|(index, chunk)| OutboundChunk {
            index: index as u32,
            bytes: chunk.to_vec(),
            sha256: sha256_hex(chunk),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Delegator side
// ---------------------------------------------------------------------------

/// Delegator-side archive transport.
pub struct ArchiveDelegatorTransport {
    inline_limit: usize,
    chunk_bytes: usize,
    pending_chunks: Mutex<HashMap<Uuid, Vec<OutboundChunk>>>,
}

impl ArchiveDelegatorTransport {
    /// Create a transport with explicit inline / chunk thresholds.
    #[must_use]
    pub fn new(inline_limit: usize, chunk_bytes: usize) -> Self {
        Self {
            inline_limit,
            chunk_bytes,
            pending_chunks: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ArchiveDelegatorTransport {
    fn default() -> Self {
        Self::new(DEFAULT_INLINE_LIMIT, DEFAULT_CHUNK_BYTES)
    }
}

#[async_trait]
impl DelegatorTransport for ArchiveDelegatorTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Archive
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            live_sync: false,
            supports_snapshots: true,
            chunked: true,
        }
    }

    async fn prepare(&self, req: PrepareRequest) -> Result<TransportHandle, TransportError> {
        let env_root = req.env_root.clone();
        let (bytes, metadata) = tokio::task::spawn_blocking(move || pack(&env_root))
            .await
            .map_err(|e| TransportError::Archive(e.to_string()))??;

        let sha256 = sha256_hex(&bytes);
        debug!(
            delegation_id = %req.delegation_id,
            files = metadata.file_count,
            archive_bytes = bytes.len(),
            "environment packed"
        );

        if bytes.len() <= self.inline_limit {
            return Ok(TransportHandle::Archive {
                sha256,
                archive_base64: Some(BASE64.encode(&bytes)),
                chunked: None,
            });
        }

        let chunks = split_chunks(&bytes, self.chunk_bytes);
        let descriptor = ChunkedDescriptor {
            chunk_count: chunks.len() as u32,
            chunk_bytes: self.chunk_bytes as u64,
        };
        self.pending_chunks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(req.delegation_id, chunks);
        Ok(TransportHandle::Archive {
            sha256,
            archive_base64: None,
            chunked: Some(descriptor),
        })
    }

    async fn outbound_chunks(
        &self,
        delegation_id: Uuid,
    ) -> Result<Vec<OutboundChunk>, TransportError> {
        Ok(self
            .pending_chunks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&delegation_id)
            .unwrap_or_default())
    }

    async fn apply_snapshot(&self, req: ApplySnapshotRequest) -> Result<(), TransportError> {
        tokio::task::spawn_blocking(move || {
            apply_to_resources(&req.snapshot_bytes, &req.resources)
        })
        .await
        .map_err(|e| TransportError::Archive(e.to_string()))?
    }

    async fn release(&self, delegation_id: Uuid) -> Result<(), TransportError> {
        self.pending_chunks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&delegation_id);
        Ok(())
    }
}

/// Route snapshot entries into the `rw` resources' source trees.
///
/// Entry paths are expected to start with a resource name component (the
/// environment layout the executor unpacked). Entries for unknown or
/// read-only resources are skipped.
fn apply_to_resources(
    bytes: &[u8],
    resources: &[awcp_core::ResourceSpec],
) -> Result<(), TransportError> {
    let decoder = GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    for entry in archive
        .entries()
        .map_err(|e| TransportError::Archive(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| TransportError::Archive(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| TransportError::Archive(e.to_string()))?
            .into_owned();

        let mut components = path.components();
        let Some(first) = components
            .next()
            .and_then(|c| c.as_os_str().to_str().map(String::from))
        else {
            continue;
        };
        let rest = components.as_path().to_path_buf();

        let Some(resource) = resources
            .iter()
            .find(|r| r.mode == AccessMode::Rw && r.name == first)
        else {
            continue;
        };

        if rest.as_os_str().is_empty() {
            std::fs::create_dir_all(&resource.source)?;
            continue;
        }
        let dest = resource.source.join(&rest);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&dest)
            .map_err(|e| TransportError::Archive(e.to_string()))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Executor side
// ---------------------------------------------------------------------------

/// Executor-side archive transport.
pub struct ArchiveExecutorTransport {
    chunks: Arc<ChunkStore>,
    chunk_wait: Duration,
}

impl ArchiveExecutorTransport {
    /// Create a transport assembling chunked uploads from `chunks`.
    #[must_use]
    pub fn new(chunks: Arc<ChunkStore>, chunk_wait: Duration) -> Self {
        Self { chunks, chunk_wait }
    }

    /// The chunk store backing this transport (shared with the daemon's
    /// chunk endpoints).
    #[must_use]
    pub fn chunk_store(&self) -> Arc<ChunkStore> {
        Arc::clone(&self.chunks)
    }
}

impl Default for ArchiveExecutorTransport {
    fn default() -> Self {
        Self::new(Arc::new(ChunkStore::new()), Duration::from_secs(300))
    }
}

#[async_trait]
impl ExecutorTransport for ArchiveExecutorTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Archive
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            live_sync: false,
            supports_snapshots: true,
            chunked: true,
        }
    }

    async fn setup(&self, req: SetupRequest) -> Result<PathBuf, TransportError> {
        let TransportHandle::Archive {
            sha256,
            archive_base64,
            chunked,
        } = &req.handle
        else {
            return Err(TransportError::HandleMismatch {
                expected: TransportKind::Archive,
                actual: req.handle.kind(),
            });
        };

        let bytes = match (archive_base64, chunked) {
            (Some(b64), _) => BASE64
                .decode(b64)
                .map_err(|e| TransportError::Decode(e.to_string()))?,
            (None, Some(descriptor)) => {
                self.chunks
                    .wait_assembled(req.delegation_id, descriptor.chunk_count, self.chunk_wait)
                    .await?
            }
            (None, None) => {
                return Err(TransportError::Decode(
                    "archive handle carries neither inline payload nor chunk descriptor".into(),
                ));
            }
        };

        verify_checksum(&bytes, sha256)?;

        let work_path = req.work_path.clone();
        tokio::task::spawn_blocking(move || unpack(&bytes, &work_path))
            .await
            .map_err(|e| TransportError::Archive(e.to_string()))??;

        debug!(delegation_id = %req.delegation_id, "archive unpacked into work path");
        Ok(req.work_path)
    }

    async fn capture_snapshot(
        &self,
        req: CaptureRequest,
    ) -> Result<Option<CapturedSnapshot>, TransportError> {
        let work_path = req.work_path.clone();
        let (bytes, metadata) = tokio::task::spawn_blocking(move || pack(&work_path))
            .await
            .map_err(|e| TransportError::Archive(e.to_string()))??;
        Ok(Some(CapturedSnapshot { bytes, metadata }))
    }

    async fn release(&self, delegation_id: Uuid, _work_path: &Path) -> Result<(), TransportError> {
        self.chunks.remove(delegation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use awcp_core::{ResourceKind, ResourceSpec};
    use std::fs;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    // -----------------------------------------------------------------------
    // Codec round trips
    // -----------------------------------------------------------------------

    #[test]
    fn pack_unpack_roundtrip_preserves_tree() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "a.txt", "hi");
        write(src.path(), "sub/deep/b.txt", "there");
        write(src.path(), ".dotfile", "hidden but shipped");

        let (bytes, metadata) = pack(src.path()).unwrap();
        assert_eq!(metadata.file_count, 3);

        let dst = tempfile::tempdir().unwrap();
        unpack(&bytes, dst.path()).unwrap();

        assert_eq!(fs::read_to_string(dst.path().join("a.txt")).unwrap(), "hi");
        assert_eq!(
            fs::read_to_string(dst.path().join("sub/deep/b.txt")).unwrap(),
            "there"
        );
        assert_eq!(
            fs::read_to_string(dst.path().join(".dotfile")).unwrap(),
            "hidden but shipped"
        );
    }

    #[test]
    fn awcp_metadata_dir_is_excluded() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "kept.txt", "yes");
        write(src.path(), ".awcp/assignments/x.json", "no");

        let (bytes, metadata) = pack(src.path()).unwrap();
        assert_eq!(metadata.file_count, 1);

        let dst = tempfile::tempdir().unwrap();
        unpack(&bytes, dst.path()).unwrap();
        assert!(dst.path().join("kept.txt").exists());
        assert!(!dst.path().join(".awcp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_dereferenced() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "real.txt", "contents");
        std::os::unix::fs::symlink(src.path().join("real.txt"), src.path().join("link.txt"))
            .unwrap();

        let (bytes, _) = pack(src.path()).unwrap();
        let dst = tempfile::tempdir().unwrap();
        unpack(&bytes, dst.path()).unwrap();

        let link = dst.path().join("link.txt");
        assert!(!link.is_symlink());
        assert_eq!(fs::read_to_string(link).unwrap(), "contents");
    }

    #[test]
    fn identical_trees_pack_identically() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        for root in [a.path(), b.path()] {
            write(root, "x/1.txt", "one");
            write(root, "y/2.txt", "two");
        }
        let (bytes_a, _) = pack(a.path()).unwrap();
        let (bytes_b, _) = pack(b.path()).unwrap();
        assert_eq!(sha256_hex(&bytes_a), sha256_hex(&bytes_b));
    }

    #[test]
    fn checksum_verification_catches_corruption() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "a.txt", "hi");
        let (mut bytes, _) = pack(src.path()).unwrap();
        let sha = sha256_hex(&bytes);
        verify_checksum(&bytes, &sha).unwrap();

        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = verify_checksum(&bytes, &sha).unwrap_err();
        assert!(matches!(err, TransportError::ChecksumMismatch { .. }));
    }

    // -----------------------------------------------------------------------
    // Chunk splitting
    // -----------------------------------------------------------------------

    #[test]
    fn split_chunks_covers_all_bytes() {
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let chunks = split_chunks(&data, 4096);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].bytes.len(), 4096);
        assert_eq!(chunks[2].bytes.len(), 10_000 - 2 * 4096);

        let mut reassembled = Vec::new();
        for chunk in &chunks {
            assert_eq!(sha256_hex(&chunk.bytes), chunk.sha256);
            reassembled.extend_from_slice(&chunk.bytes);
        }
        assert_eq!(reassembled, data);
    }

    // -----------------------------------------------------------------------
    // Transport behaviors
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn inline_prepare_then_setup_roundtrip() {
        let env = tempfile::tempdir().unwrap();
        write(env.path(), "ws/a.txt", "hi");

        let delegator = ArchiveDelegatorTransport::default();
        let handle = delegator
            .prepare(PrepareRequest {
                delegation_id: Uuid::new_v4(),
                env_root: env.path().to_path_buf(),
                ttl_seconds: 60,
            })
            .await
            .unwrap();

        let work = tempfile::tempdir().unwrap();
        let work_path = work.path().join("w");
        let executor = ArchiveExecutorTransport::default();
        let effective = executor
            .setup(SetupRequest {
                delegation_id: Uuid::new_v4(),
                handle,
                work_path: work_path.clone(),
            })
            .await
            .unwrap();

        assert_eq!(effective, work_path);
        assert_eq!(
            fs::read_to_string(work_path.join("ws/a.txt")).unwrap(),
            "hi"
        );
    }

    fn incompressible(len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut x: u32 = 0x2545_f491;
        for _ in 0..len {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            out.push(x as u8);
        }
        out
    }

    #[tokio::test]
    async fn chunked_prepare_exposes_outbound_chunks() {
        let env = tempfile::tempdir().unwrap();
        fs::create_dir_all(env.path().join("ws")).unwrap();
        fs::write(env.path().join("ws/big.bin"), incompressible(64 * 1024)).unwrap();

        let delegator = ArchiveDelegatorTransport::new(1024, 8 * 1024);
        let id = Uuid::new_v4();
        let handle = delegator
            .prepare(PrepareRequest {
                delegation_id: id,
                env_root: env.path().to_path_buf(),
                ttl_seconds: 60,
            })
            .await
            .unwrap();

        let TransportHandle::Archive {
            chunked: Some(descriptor),
            archive_base64: None,
            ..
        } = &handle
        else {
            panic!("expected chunked handle, got {handle:?}");
        };

        let chunks = delegator.outbound_chunks(id).await.unwrap();
        assert_eq!(chunks.len() as u32, descriptor.chunk_count);
        // Chunks are handed out exactly once.
        assert!(delegator.outbound_chunks(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn setup_rejects_corrupted_inline_payload() {
        let env = tempfile::tempdir().unwrap();
        write(env.path(), "a.txt", "hi");
        let delegator = ArchiveDelegatorTransport::default();
        let handle = delegator
            .prepare(PrepareRequest {
                delegation_id: Uuid::new_v4(),
                env_root: env.path().to_path_buf(),
                ttl_seconds: 60,
            })
            .await
            .unwrap();

        let TransportHandle::Archive {
            sha256,
            archive_base64: Some(b64),
            ..
        } = handle
        else {
            panic!("expected inline handle");
        };
        let mut bytes = BASE64.decode(&b64).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = TransportHandle::Archive {
            sha256,
            archive_base64: Some(BASE64.encode(&bytes)),
            chunked: None,
        };

        let work = tempfile::tempdir().unwrap();
        let executor = ArchiveExecutorTransport::default();
        let err = executor
            .setup(SetupRequest {
                delegation_id: Uuid::new_v4(),
                handle: tampered,
                work_path: work.path().join("w"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn setup_rejects_foreign_handle() {
        let executor = ArchiveExecutorTransport::default();
        let err = executor
            .setup(SetupRequest {
                delegation_id: Uuid::new_v4(),
                handle: TransportHandle::Mount {
                    endpoint: "host:22".into(),
                    export: "/env".into(),
                    credential: awcp_core::handle::TransportCredential {
                        secret: "s".into(),
                        expires_at: chrono::Utc::now(),
                    },
                },
                work_path: PathBuf::from("/tmp/unused"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::HandleMismatch { .. }));
    }

    #[tokio::test]
    async fn apply_snapshot_writes_only_rw_resources() {
        // The executor's work tree: two top-level resource dirs.
        let work = tempfile::tempdir().unwrap();
        write(work.path(), "docs/readme.md", "updated");
        write(work.path(), "secrets/token.txt", "should not flow back");

        let executor = ArchiveExecutorTransport::default();
        let captured = executor
            .capture_snapshot(CaptureRequest {
                delegation_id: Uuid::new_v4(),
                work_path: work.path().to_path_buf(),
            })
            .await
            .unwrap()
            .unwrap();

        let docs_src = tempfile::tempdir().unwrap();
        let secrets_src = tempfile::tempdir().unwrap();
        let resources = vec![
            ResourceSpec {
                name: "docs".into(),
                kind: ResourceKind::Directory,
                source: docs_src.path().to_path_buf(),
                mode: AccessMode::Rw,
            },
            ResourceSpec {
                name: "secrets".into(),
                kind: ResourceKind::Directory,
                source: secrets_src.path().to_path_buf(),
                mode: AccessMode::Ro,
            },
        ];

        let delegator = ArchiveDelegatorTransport::default();
        delegator
            .apply_snapshot(ApplySnapshotRequest {
                delegation_id: Uuid::new_v4(),
                snapshot_bytes: captured.bytes,
                resources,
            })
            .await
            .unwrap();

        assert_eq!(
            fs::read_to_string(docs_src.path().join("readme.md")).unwrap(),
            "updated"
        );
        assert!(!secrets_src.path().join("token.txt").exists());
    }
}
