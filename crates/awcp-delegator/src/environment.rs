// SPDX-License-Identifier: MIT OR Apache-2.0
//! Materializes delegation environments on disk.
//!
//! Each delegation gets `<base>/environments/<id>/` with one child per
//! resource, named after the resource and pointing at (or copied from)
//! its source. The manifest `env.json` inside the root records what was
//! materialized for crash recovery. Release removes the tree exactly
//! once; releasing an already-released environment is a no-op.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use awcp_core::ResourceSpec;

/// How a resource is placed under the environment root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Symlink to the source (default; transports dereference on read).
    Symlink,
    /// Deep copy of the source tree.
    Copy,
}

/// Manifest written into every environment root.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvManifest {
    delegation_id: Uuid,
    resources: Vec<ResourceSpec>,
}

/// Owns the `<base>/environments` tree.
pub struct EnvironmentManager {
    base: PathBuf,
}

impl EnvironmentManager {
    /// Create a manager rooted at `<base_dir>/environments`.
    #[must_use]
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base: base_dir.join("environments"),
        }
    }

    /// The environment root path for a delegation (whether or not built).
    #[must_use]
    pub fn env_root(&self, delegation_id: Uuid) -> PathBuf {
        self.base.join(delegation_id.to_string())
    }

    /// Materialize the environment for a delegation.
    ///
    /// # Errors
    ///
    /// Fails when the root cannot be created or a resource cannot be
    /// linked or copied.
    pub fn build(
        &self,
        delegation_id: Uuid,
        resources: &[ResourceSpec],
        mode: LinkMode,
    ) -> Result<PathBuf> {
        let root = self.env_root(delegation_id);
        fs::create_dir_all(&root)
            .with_context(|| format!("create environment root {}", root.display()))?;

        for resource in resources {
            let child = root.join(&resource.name);
            match mode {
                LinkMode::Symlink => {
                    #[cfg(unix)]
                    std::os::unix::fs::symlink(&resource.source, &child).with_context(|| {
                        format!("symlink {} -> {}", child.display(), resource.source.display())
                    })?;
                    #[cfg(not(unix))]
                    copy_tree(&resource.source, &child)?;
                }
                LinkMode::Copy => copy_tree(&resource.source, &child)?,
            }
        }

        let manifest = EnvManifest {
            delegation_id,
            resources: resources.to_vec(),
        };
        let manifest_path = root.join("env.json");
        fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
            .with_context(|| format!("write {}", manifest_path.display()))?;

        info!(delegation_id = %delegation_id, root = %root.display(), "environment built");
        Ok(root)
    }

    /// Remove the environment tree. Idempotent.
    ///
    /// # Errors
    ///
    /// Fails only on an IO error other than the tree already being gone.
    pub fn release(&self, delegation_id: Uuid) -> Result<()> {
        let root = self.env_root(delegation_id);
        match fs::remove_dir_all(&root) {
            Ok(()) => {
                info!(delegation_id = %delegation_id, "environment released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", root.display())),
        }
    }

    /// Remove environment directories that do not belong to any known
    /// delegation (crash recovery). Returns how many were removed.
    pub fn cleanup_stale(&self, known_ids: &HashSet<Uuid>) -> usize {
        let Ok(entries) = fs::read_dir(&self.base) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let keep = name
                .to_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .is_some_and(|id| known_ids.contains(&id));
            if keep {
                continue;
            }
            if let Err(err) = fs::remove_dir_all(entry.path()) {
                warn!(path = %entry.path().display(), error = %err, "failed to remove stale environment");
            } else {
                removed += 1;
            }
        }
        removed
    }
}

/// Recursively copy `src` into `dst`, preserving symlinks as links.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            {
                let link = fs::read_link(entry.path())?;
                std::os::unix::fs::symlink(link, &target)?;
            }
            #[cfg(not(unix))]
            {
                fs::copy(entry.path(), &target)?;
            }
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}
