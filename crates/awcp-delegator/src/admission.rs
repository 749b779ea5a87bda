// SPDX-License-Identifier: MIT OR Apache-2.0
//! Preflight admission scan for resource trees.
//!
//! Walks a resource's source directory before anything is materialized,
//! accumulating total bytes, file count, and largest-file size, and
//! collecting paths that match the configured sensitive globs. IO errors
//! on individual children fail open: a missing or permission-denied
//! entry is skipped, never propagated.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use awcp_config::{AdmissionLimits, DelegatorConfig};
use awcp_core::error::{ErrorCode, ErrorRecord};

/// Accumulated scan results for one resource tree.
#[derive(Debug, Default, Clone)]
pub struct ScanStats {
    /// Summed size of all regular files, in bytes.
    pub total_bytes: u64,
    /// Number of regular files.
    pub file_count: u64,
    /// Size of the largest single file, in bytes.
    pub largest_file_bytes: u64,
    /// Relative paths matching a sensitive pattern.
    pub sensitive_paths: Vec<String>,
}

/// Enforces size, count, and sensitive-content bounds on resource trees.
pub struct AdmissionController {
    limits: AdmissionLimits,
    sensitive: GlobSet,
    skip_sensitive_check: bool,
}

fn megabytes(bytes: u64) -> u64 {
    bytes / (1024 * 1024)
}

impl AdmissionController {
    /// Build a controller from the delegator configuration.
    ///
    /// # Errors
    ///
    /// Fails when a configured sensitive pattern is not a valid glob.
    pub fn new(config: &DelegatorConfig) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.sensitive_patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            limits: config.admission,
            sensitive: builder.build()?,
            skip_sensitive_check: config.skip_sensitive_check,
        })
    }

    /// Scan `source` and enforce the configured bounds.
    ///
    /// # Errors
    ///
    /// - [`ErrorCode::WorkspaceTooLarge`] when total bytes, file count, or
    ///   largest-file size exceeds its threshold. The hint names the
    ///   offending metric with observed and limit values.
    /// - [`ErrorCode::SensitiveFiles`] when sensitive matches exist and
    ///   scanning is enabled, listing the offending relative paths.
    pub fn check(&self, source: &Path, delegation_id: Uuid) -> Result<ScanStats, ErrorRecord> {
        let stats = self.scan(source);
        debug!(
            delegation_id = %delegation_id,
            source = %source.display(),
            files = stats.file_count,
            bytes = stats.total_bytes,
            "admission scan finished"
        );

        if stats.total_bytes > self.limits.max_total_bytes {
            return Err(ErrorRecord::new(
                ErrorCode::WorkspaceTooLarge,
                format!("workspace at {} is too large", source.display()),
            )
            .with_hint(format!(
                "total size {}MB exceeds the {}MB limit; delegate a smaller subtree",
                megabytes(stats.total_bytes),
                megabytes(self.limits.max_total_bytes)
            )));
        }
        if stats.file_count > self.limits.max_file_count {
            return Err(ErrorRecord::new(
                ErrorCode::WorkspaceTooLarge,
                format!("workspace at {} has too many files", source.display()),
            )
            .with_hint(format!(
                "{} files exceeds the {} file limit; delegate a smaller subtree",
                stats.file_count, self.limits.max_file_count
            )));
        }
        if stats.largest_file_bytes > self.limits.max_file_bytes {
            return Err(ErrorRecord::new(
                ErrorCode::WorkspaceTooLarge,
                format!("workspace at {} contains an oversized file", source.display()),
            )
            .with_hint(format!(
                "largest file is {}MB, limit is {}MB per file",
                megabytes(stats.largest_file_bytes),
                megabytes(self.limits.max_file_bytes)
            )));
        }

        if !self.skip_sensitive_check && !stats.sensitive_paths.is_empty() {
            return Err(ErrorRecord::new(
                ErrorCode::SensitiveFiles,
                format!(
                    "workspace at {} contains sensitive files: {}",
                    source.display(),
                    stats.sensitive_paths.join(", ")
                ),
            )
            .with_hint(
                "remove the files, delegate a different subtree, or set skipSensitiveCheck",
            ));
        }

        Ok(stats)
    }

    fn scan(&self, source: &Path) -> ScanStats {
        let mut stats = ScanStats::default();

        let walker = WalkDir::new(source).into_iter().filter_entry(|e| {
            e.file_name() != std::ffi::OsStr::new(".git")
                && e.file_name() != std::ffi::OsStr::new("node_modules")
        });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    // Fail open: unreadable children never block admission.
                    warn!(error = %err, "skipping unreadable entry during admission scan");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            stats.file_count += 1;
            stats.total_bytes += size;
            stats.largest_file_bytes = stats.largest_file_bytes.max(size);

            let rel = entry
                .path()
                .strip_prefix(source)
                .unwrap_or(entry.path())
                .to_path_buf();
            let file_name = entry.file_name().to_string_lossy();
            if self.sensitive.is_match(&rel) || self.sensitive.is_match(file_name.as_ref()) {
                stats.sensitive_paths.push(rel.display().to_string());
            }
        }

        stats.sensitive_paths.sort();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn controller(limits: AdmissionLimits, skip_sensitive: bool) -> AdmissionController {
        let config = DelegatorConfig {
            admission: limits,
            skip_sensitive_check: skip_sensitive,
            ..DelegatorConfig::default()
        };
        AdmissionController::new(&config).unwrap()
    }

    fn write(root: &Path, rel: &str, len: usize) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![b'x'; len]).unwrap();
    }

    #[test]
    fn small_clean_workspace_passes() {
        let ws = tempfile::tempdir().unwrap();
        write(ws.path(), "src/main.rs", 100);
        write(ws.path(), "README.md", 50);

        let ctl = controller(AdmissionLimits::default(), false);
        let stats = ctl.check(ws.path(), Uuid::new_v4()).unwrap();
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.total_bytes, 150);
    }

    #[test]
    fn total_size_limit_names_both_values() {
        let ws = tempfile::tempdir().unwrap();
        write(ws.path(), "blob.bin", 3 * 1024 * 1024);

        let ctl = controller(
            AdmissionLimits {
                max_total_bytes: 2 * 1024 * 1024,
                ..AdmissionLimits::default()
            },
            false,
        );
        let err = ctl.check(ws.path(), Uuid::new_v4()).unwrap_err();
        assert_eq!(err.code, ErrorCode::WorkspaceTooLarge);
        let hint = err.hint.unwrap();
        assert!(hint.contains("3MB"), "hint was: {hint}");
        assert!(hint.contains("2MB"), "hint was: {hint}");
    }

    #[test]
    fn file_count_limit_enforced() {
        let ws = tempfile::tempdir().unwrap();
        for i in 0..5 {
            write(ws.path(), &format!("f{i}.txt"), 1);
        }
        let ctl = controller(
            AdmissionLimits {
                max_file_count: 4,
                ..AdmissionLimits::default()
            },
            false,
        );
        let err = ctl.check(ws.path(), Uuid::new_v4()).unwrap_err();
        assert_eq!(err.code, ErrorCode::WorkspaceTooLarge);
        assert!(err.hint.unwrap().contains("file limit"));
    }

    #[test]
    fn largest_file_limit_enforced() {
        let ws = tempfile::tempdir().unwrap();
        write(ws.path(), "huge.iso", 2 * 1024 * 1024);
        let ctl = controller(
            AdmissionLimits {
                max_file_bytes: 1024 * 1024,
                ..AdmissionLimits::default()
            },
            false,
        );
        let err = ctl.check(ws.path(), Uuid::new_v4()).unwrap_err();
        assert!(err.hint.unwrap().contains("per file"));
    }

    #[test]
    fn sensitive_files_listed_by_relative_path() {
        let ws = tempfile::tempdir().unwrap();
        write(ws.path(), "src/ok.rs", 10);
        write(ws.path(), ".env", 10);
        write(ws.path(), "certs/server.pem", 10);

        let ctl = controller(AdmissionLimits::default(), false);
        let err = ctl.check(ws.path(), Uuid::new_v4()).unwrap_err();
        assert_eq!(err.code, ErrorCode::SensitiveFiles);
        assert!(err.message.contains(".env"));
        assert!(err.message.contains("certs/server.pem"));
        assert!(!err.message.contains("ok.rs"));
    }

    #[test]
    fn skip_flag_suppresses_sensitive_failure() {
        let ws = tempfile::tempdir().unwrap();
        write(ws.path(), ".env", 10);

        let ctl = controller(AdmissionLimits::default(), true);
        let stats = ctl.check(ws.path(), Uuid::new_v4()).unwrap();
        // Matches are still collected, they just do not fail the check.
        assert_eq!(stats.sensitive_paths, vec![".env".to_string()]);
    }

    #[test]
    fn git_and_node_modules_are_skipped() {
        let ws = tempfile::tempdir().unwrap();
        write(ws.path(), "src/lib.rs", 10);
        write(ws.path(), ".git/objects/pack/huge.pack", 1000);
        write(ws.path(), "node_modules/dep/index.js", 1000);

        let ctl = controller(AdmissionLimits::default(), false);
        let stats = ctl.check(ws.path(), Uuid::new_v4()).unwrap();
        assert_eq!(stats.file_count, 1);
        assert_eq!(stats.total_bytes, 10);
    }

    #[test]
    fn missing_source_fails_open_with_empty_stats() {
        let ctl = controller(AdmissionLimits::default(), false);
        let stats = ctl
            .check(Path::new("/definitely/not/a/real/path"), Uuid::new_v4())
            .unwrap();
        assert_eq!(stats.file_count, 0);
    }
}
