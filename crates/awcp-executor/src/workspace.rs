// SPDX-License-Identifier: MIT OR Apache-2.0
//! Work-path allocation and lifecycle under the executor's work directory.
//!
//! Every assignment gets `<work_dir>/<id>`. Allocation validates the path
//! stays beneath the work directory, preparation guarantees an existing
//! empty directory (crash leftovers are wiped), and release removes the
//! tree idempotently. The `.awcp` metadata tree is never touched by
//! stale-cleanup.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use awcp_core::error::{ErrorCode, ErrorRecord};

/// Owns the executor's work directory tree.
pub struct WorkspaceManager {
    work_dir: PathBuf,
}

impl WorkspaceManager {
    /// Create a manager over `work_dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Fails when the work directory cannot be created.
    pub fn new(work_dir: &Path) -> Result<Self> {
        fs::create_dir_all(work_dir)
            .with_context(|| format!("create work dir {}", work_dir.display()))?;
        Ok(Self {
            work_dir: work_dir.to_path_buf(),
        })
    }

    /// The work path for an assignment (whether or not allocated).
    #[must_use]
    pub fn work_path(&self, id: Uuid) -> PathBuf {
        self.work_dir.join(id.to_string())
    }

    /// Allocate the work path for an assignment, validating containment.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::WorkdirDenied`] when the resolved path would escape
    /// the work directory.
    pub fn allocate(&self, id: Uuid) -> Result<PathBuf, ErrorRecord> {
        let path = self.work_path(id);
        // The id is a UUID so traversal cannot normally occur, but the
        // containment invariant is cheap to enforce unconditionally.
        let escapes = path
            .strip_prefix(&self.work_dir)
            .map(|rel| rel.components().any(|c| matches!(c, Component::ParentDir)))
            .unwrap_or(true);
        if escapes {
            return Err(ErrorRecord::new(
                ErrorCode::WorkdirDenied,
                format!("allocated path {} escapes the work directory", path.display()),
            ));
        }
        Ok(path)
    }

    /// Ensure the work path exists and is empty. Leftovers from a crashed
    /// previous run are wiped.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be (re)created.
    pub fn prepare(&self, path: &Path) -> Result<()> {
        if path.exists() {
            let occupied = fs::read_dir(path)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false);
            if occupied {
                warn!(path = %path.display(), "work path not empty; wiping leftovers");
                fs::remove_dir_all(path)
                    .with_context(|| format!("wipe work path {}", path.display()))?;
            }
        }
        fs::create_dir_all(path).with_context(|| format!("create work path {}", path.display()))
    }

    /// Remove an assignment's work tree. Idempotent.
    ///
    /// # Errors
    ///
    /// Fails only on an IO error other than the tree already being gone.
    pub fn release(&self, id: Uuid) -> Result<()> {
        let path = self.work_path(id);
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                info!(delegation_id = %id, "workspace released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }

    /// Remove work directories that belong to no known assignment,
    /// skipping the `.awcp` metadata tree. Returns how many were removed.
    pub fn cleanup_stale(&self, known_ids: &HashSet<Uuid>) -> usize {
        let Ok(entries) = fs::read_dir(&self.work_dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name == ".awcp" {
                continue;
            }
            let keep = name
                .to_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .is_some_and(|id| known_ids.contains(&id));
            if keep {
                continue;
            }
            if let Err(err) = fs::remove_dir_all(entry.path()) {
                warn!(path = %entry.path().display(), error = %err, "failed to remove stale work path");
            } else {
                removed += 1;
            }
        }
        removed
    }
}
