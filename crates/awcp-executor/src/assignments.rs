// SPDX-License-Identifier: MIT OR Apache-2.0
//! Write-through JSON persistence for assignment records.
//!
//! One file per assignment under `<work_dir>/.awcp/assignments/<id>.json`.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::error;
use uuid::Uuid;

use awcp_core::Assignment;

/// File-based assignment store.
#[derive(Debug)]
pub struct AssignmentStore {
    root: PathBuf,
}

impl AssignmentStore {
    /// Create a store rooted at `<work_dir>/.awcp/assignments`.
    #[must_use]
    pub fn new(work_dir: &Path) -> Self {
        Self {
            root: work_dir.join(".awcp").join("assignments"),
        }
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    /// Persist an assignment record to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self, assignment: &Assignment) -> Result<PathBuf> {
        let path = self.record_path(assignment.id);
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create assignment dir {}", self.root.display()))?;
        let json = serde_json::to_string_pretty(assignment)?;
        fs::write(&path, json)
            .with_context(|| format!("write assignment to {}", path.display()))?;
        Ok(path)
    }

    /// Load every parseable record; unparseable files are logged and
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store directory exists but cannot be
    /// listed.
    pub fn load_all(&self) -> Result<Vec<Assignment>> {
        let dir = match fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("read assignment dir {}", self.root.display())));
            }
        };

        let mut records = Vec::new();
        for entry in dir {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(anyhow::Error::new)
                .and_then(|json| serde_json::from_str::<Assignment>(&json).map_err(Into::into))
            {
                Ok(record) => records.push(record),
                Err(err) => {
                    error!(path = %path.display(), error = %err, "skipping unreadable assignment record");
                }
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    /// Delete a record. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error on IO failures other than the file already being
    /// gone.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }
}
