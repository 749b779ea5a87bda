// SPDX-License-Identifier: MIT OR Apache-2.0
//! Write-through JSON persistence for delegation records.
//!
//! One file per delegation under `<base>/delegations/<id>.json`. The
//! service persists after every state change or recovery-relevant field
//! mutation; a successful externally-visible response implies the record
//! is on disk.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::error;
use uuid::Uuid;

use awcp_core::Delegation;

/// File-based delegation store.
#[derive(Debug)]
pub struct DelegationStore {
    root: PathBuf,
}

impl DelegationStore {
    /// Create a store rooted at `<base_dir>/delegations`.
    #[must_use]
    pub fn new(base_dir: &Path) -> Self {
        Self {
            root: base_dir.join("delegations"),
        }
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    /// Persist a delegation record to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self, delegation: &Delegation) -> Result<PathBuf> {
        let path = self.record_path(delegation.id);
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create delegation dir {}", self.root.display()))?;
        let json = serde_json::to_string_pretty(delegation)?;
        fs::write(&path, json).with_context(|| format!("write delegation to {}", path.display()))?;
        Ok(path)
    }

    /// Load a delegation record by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(&self, id: Uuid) -> Result<Delegation> {
        let path = self.record_path(id);
        let json = fs::read_to_string(&path)
            .with_context(|| format!("read delegation from {}", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Load every parseable record. Unparseable files are logged and
    /// skipped so one corrupt record cannot block startup.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store directory exists but cannot be
    /// listed.
    pub fn load_all(&self) -> Result<Vec<Delegation>> {
        let dir = match fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("read delegation dir {}", self.root.display())));
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
                .and_then(|json| serde_json::from_str::<Delegation>(&json).map_err(Into::into))
            {
                Ok(record) => records.push(record),
                Err(err) => {
                    error!(path = %path.display(), error = %err, "skipping unreadable delegation record");
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

#[cfg(test)]
mod tests {
    use super::*;
    use awcp_core::handle::TransportKind;
    use awcp_core::state::DelegationEvent;
    use awcp_core::{AccessMode, LeaseConfig, SnapshotPolicy, SnapshotSettings, TaskSpec};

    fn delegation() -> Delegation {
        Delegation::new(
            Uuid::new_v4(),
            "http://localhost:4001",
            TaskSpec {
                description: "d".into(),
                prompt: "p".into(),
            },
            vec![],
            LeaseConfig {
                ttl_seconds: 60,
                access_mode: AccessMode::Ro,
            },
            SnapshotSettings {
                policy: SnapshotPolicy::Auto,
                retention_ms: 1000,
                max_snapshots: 4,
            },
            TransportKind::Archive,
        )
    }

    #[test]
    fn save_load_roundtrip() {
        let base = tempfile::tempdir().unwrap();
        let store = DelegationStore::new(base.path());
        let mut d = delegation();
        d.apply(DelegationEvent::SendInvite).unwrap();

        store.save(&d).unwrap();
        let back = store.load(d.id).unwrap();
        assert_eq!(back.id, d.id);
        assert_eq!(back.state, d.state);
    }

    #[test]
    fn load_all_skips_garbage() {
        let base = tempfile::tempdir().unwrap();
        let store = DelegationStore::new(base.path());
        store.save(&delegation()).unwrap();
        store.save(&delegation()).unwrap();
        fs::write(base.path().join("delegations/garbage.json"), "{not json").unwrap();
        fs::write(base.path().join("delegations/notes.txt"), "ignored").unwrap();

        let records = store.load_all().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn load_all_on_missing_dir_is_empty() {
        let base = tempfile::tempdir().unwrap();
        let store = DelegationStore::new(&base.path().join("nope"));
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let store = DelegationStore::new(base.path());
        let d = delegation();
        store.save(&d).unwrap();
        store.delete(d.id).unwrap();
        assert!(store.load(d.id).is_err());
        store.delete(d.id).unwrap();
    }
}
