// SPDX-License-Identifier: MIT OR Apache-2.0
//! Staged-snapshot persistence.
//!
//! Staged snapshots live at
//! `<base>/snapshots/<delegation_id>/<snapshot_id>/snapshot.tar.gz` with a
//! sibling `metadata.json` describing what was captured. Auto-applied and
//! discarded snapshots never touch this store.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use awcp_core::EnvironmentSnapshot;

/// File name of the staged archive inside a snapshot directory.
pub const ARCHIVE_FILE: &str = "snapshot.tar.gz";

/// File name of the staged metadata inside a snapshot directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Owns the `<base>/snapshots` tree.
pub struct SnapshotStore {
    base: PathBuf,
}

impl SnapshotStore {
    /// Create a store rooted at `<base_dir>/snapshots`.
    #[must_use]
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base: base_dir.join("snapshots"),
        }
    }

    fn snapshot_dir(&self, delegation_id: Uuid, snapshot_id: &str) -> PathBuf {
        self.base.join(delegation_id.to_string()).join(snapshot_id)
    }

    /// Persist a staged snapshot's archive bytes and metadata record.
    ///
    /// Returns the path of the written archive.
    ///
    /// # Errors
    ///
    /// Fails when the directory or either file cannot be written.
    pub fn stage(&self, record: &EnvironmentSnapshot, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.snapshot_dir(record.delegation_id, &record.snapshot_id);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

        let archive_path = dir.join(ARCHIVE_FILE);
        fs::write(&archive_path, bytes)
            .with_context(|| format!("write {}", archive_path.display()))?;

        let metadata_path = dir.join(METADATA_FILE);
        fs::write(&metadata_path, serde_json::to_vec_pretty(record)?)
            .with_context(|| format!("write {}", metadata_path.display()))?;

        Ok(archive_path)
    }

    /// Load a staged snapshot's archive bytes.
    ///
    /// # Errors
    ///
    /// Fails when the archive does not exist or cannot be read.
    pub fn load(&self, delegation_id: Uuid, snapshot_id: &str) -> Result<Vec<u8>> {
        let path = self.snapshot_dir(delegation_id, snapshot_id).join(ARCHIVE_FILE);
        fs::read(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Remove one staged snapshot. Idempotent.
    ///
    /// # Errors
    ///
    /// Fails only on IO errors other than the directory already being gone.
    pub fn discard(&self, delegation_id: Uuid, snapshot_id: &str) -> Result<()> {
        let dir = self.snapshot_dir(delegation_id, snapshot_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", dir.display())),
        }
    }

    /// Remove every staged snapshot of a delegation. Idempotent.
    pub fn remove_all(&self, delegation_id: Uuid) {
        let dir = self.base.join(delegation_id.to_string());
        if let Err(err) = fs::remove_dir_all(&dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %dir.display(), error = %err, "failed to remove snapshot directory");
            }
        }
    }

    /// Remove snapshot directories not belonging to any known delegation.
    pub fn cleanup_stale(&self, known_ids: &HashSet<Uuid>) -> usize {
        let Ok(entries) = fs::read_dir(&self.base) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let keep = entry
                .file_name()
                .to_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .is_some_and(|id| known_ids.contains(&id));
            if keep {
                continue;
            }
            if fs::remove_dir_all(entry.path()).is_ok() {
                removed += 1;
            }
        }
        removed
    }
}
