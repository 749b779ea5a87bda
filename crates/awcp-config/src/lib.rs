// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and defaults for the AWCP daemons.
//!
//! Both daemons load a TOML file (all fields optional, every knob has a
//! default), apply CLI overrides, validate, and then treat the result as
//! immutable. Per-delegation state never lives here.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Errors and warnings
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Sensitive-file scanning is turned off.
    SensitiveCheckDisabled,
    /// A default TTL longer than a day was configured.
    LargeDefaultTtl {
        /// The configured TTL in seconds.
        secs: u64,
    },
    /// Terminal records are retained for less than a minute.
    ShortRetention {
        /// The configured retention in seconds.
        secs: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::SensitiveCheckDisabled => {
                write!(f, "sensitive-file scanning is disabled")
            }
            ConfigWarning::LargeDefaultTtl { secs } => {
                write!(f, "default ttl is unusually large ({secs}s)")
            }
            ConfigWarning::ShortRetention { secs } => {
                write!(f, "retention window is very short ({secs}s)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared pieces
// ---------------------------------------------------------------------------

/// Byte and file-count thresholds enforced by the delegator's admission scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AdmissionLimits {
    /// Upper bound on the summed size of a resource tree, in bytes.
    pub max_total_bytes: u64,
    /// Upper bound on the number of files in a resource tree.
    pub max_file_count: u64,
    /// Upper bound on any single file, in bytes.
    pub max_file_bytes: u64,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_total_bytes: 100 * 1024 * 1024,
            max_file_count: 10_000,
            max_file_bytes: 25 * 1024 * 1024,
        }
    }
}

/// Sandbox posture advertised by the executor in ACCEPT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SandboxConfig {
    /// Confine the task to the work directory.
    pub cwd_only: bool,
    /// Allow the task network access.
    pub allow_network: bool,
    /// Allow the task to execute subprocesses.
    pub allow_exec: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            cwd_only: true,
            allow_network: true,
            allow_exec: true,
        }
    }
}

fn default_sensitive_patterns() -> Vec<String> {
    [
        ".env",
        ".env.*",
        "*.pem",
        "*.key",
        "id_rsa*",
        "id_ed25519*",
        "*credentials*.json",
        ".npmrc",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

// ---------------------------------------------------------------------------
// Delegator configuration
// ---------------------------------------------------------------------------

/// Runtime settings for the delegator daemon. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DelegatorConfig {
    /// Bind address for the local HTTP API.
    pub bind: String,
    /// Root directory for delegation records, environments, and snapshots.
    pub base_dir: PathBuf,
    /// Admission thresholds.
    pub admission: AdmissionLimits,
    /// Glob patterns the admission scan treats as sensitive.
    pub sensitive_patterns: Vec<String>,
    /// Skip the sensitive-file scan entirely.
    pub skip_sensitive_check: bool,
    /// Lease TTL used when the caller does not specify one, in seconds.
    pub default_ttl_seconds: u64,
    /// Access mode used when the caller does not specify one (`ro`/`rw`).
    pub default_access_mode: String,
    /// Snapshot handling used when the caller does not specify one.
    pub default_snapshot_policy: String,
    /// How long staged snapshots are retained, in milliseconds.
    pub snapshot_retention_ms: u64,
    /// Upper bound on snapshots recorded per delegation.
    pub max_snapshots: usize,
    /// How long terminal delegations are retained, in seconds.
    pub retention_secs: u64,
    /// Timeout for control-plane calls, in seconds.
    pub control_timeout_secs: u64,
    /// Timeout for START messages carrying large inline handles, in seconds.
    pub handle_timeout_secs: u64,
    /// SSE connection-establishment attempts.
    pub sse_retry_attempts: u32,
    /// Linear backoff base between SSE attempts, in milliseconds.
    pub sse_retry_base_ms: u64,
    /// Cleanup sweep period, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for DelegatorConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3100".into(),
            base_dir: PathBuf::from(".awcp-delegator"),
            admission: AdmissionLimits::default(),
            sensitive_patterns: default_sensitive_patterns(),
            skip_sensitive_check: false,
            default_ttl_seconds: 3600,
            default_access_mode: "ro".into(),
            default_snapshot_policy: "staged".into(),
            snapshot_retention_ms: 24 * 60 * 60 * 1000,
            max_snapshots: 16,
            retention_secs: 3600,
            control_timeout_secs: 30,
            handle_timeout_secs: 300,
            sse_retry_attempts: 3,
            sse_retry_base_ms: 500,
            sweep_interval_secs: 60,
        }
    }
}

impl DelegatorConfig {
    /// Load from a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileNotFound`] or [`ConfigError::ParseError`].
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }

    /// Semantic validation; returns advisory warnings on success.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] collecting every problem found.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut reasons = Vec::new();
        if self.bind.is_empty() {
            reasons.push("bind must not be empty".to_string());
        }
        if self.default_ttl_seconds == 0 {
            reasons.push("default_ttl_seconds must be positive".to_string());
        }
        if self.admission.max_total_bytes == 0 || self.admission.max_file_count == 0 {
            reasons.push("admission limits must be positive".to_string());
        }
        if !matches!(self.default_access_mode.as_str(), "ro" | "rw") {
            reasons.push(format!(
                "default_access_mode must be ro or rw (got '{}')",
                self.default_access_mode
            ));
        }
        if !matches!(
            self.default_snapshot_policy.as_str(),
            "auto" | "staged" | "discard"
        ) {
            reasons.push(format!(
                "default_snapshot_policy must be auto, staged, or discard (got '{}')",
                self.default_snapshot_policy
            ));
        }
        if self.sse_retry_attempts == 0 {
            reasons.push("sse_retry_attempts must be at least 1".to_string());
        }
        if !reasons.is_empty() {
            return Err(ConfigError::ValidationError { reasons });
        }

        let mut warnings = Vec::new();
        if self.skip_sensitive_check {
            warnings.push(ConfigWarning::SensitiveCheckDisabled);
        }
        if self.default_ttl_seconds > 86_400 {
            warnings.push(ConfigWarning::LargeDefaultTtl {
                secs: self.default_ttl_seconds,
            });
        }
        if self.retention_secs < 60 {
            warnings.push(ConfigWarning::ShortRetention {
                secs: self.retention_secs,
            });
        }
        Ok(warnings)
    }
}

// ---------------------------------------------------------------------------
// Executor configuration
// ---------------------------------------------------------------------------

/// Runtime settings for the executor daemon. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Bind address for the AWCP endpoint.
    pub bind: String,
    /// Root directory for assignment work paths.
    pub work_dir: PathBuf,
    /// Maximum number of concurrently active assignments.
    pub max_concurrent: usize,
    /// Hard cap on any accepted lease, in seconds.
    pub max_ttl_seconds: u64,
    /// Accept read-write delegations.
    pub accept_rw: bool,
    /// Credential INVITEs must present, when set.
    pub required_auth: Option<String>,
    /// Sandbox posture advertised in ACCEPT.
    pub sandbox: SandboxConfig,
    /// How long terminal assignments are retained, in seconds.
    pub retention_secs: u64,
    /// How long incomplete chunk uploads are kept, in seconds.
    pub chunk_timeout_secs: u64,
    /// Cleanup sweep period, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:4001".into(),
            work_dir: PathBuf::from(".awcp-executor"),
            max_concurrent: 4,
            max_ttl_seconds: 86_400,
            accept_rw: true,
            required_auth: None,
            sandbox: SandboxConfig::default(),
            retention_secs: 3600,
            chunk_timeout_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

impl ExecutorConfig {
    /// Load from a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileNotFound`] or [`ConfigError::ParseError`].
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }

    /// Semantic validation; returns advisory warnings on success.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] collecting every problem found.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut reasons = Vec::new();
        if self.bind.is_empty() {
            reasons.push("bind must not be empty".to_string());
        }
        if self.max_concurrent == 0 {
            reasons.push("max_concurrent must be at least 1".to_string());
        }
        if self.max_ttl_seconds == 0 {
            reasons.push("max_ttl_seconds must be positive".to_string());
        }
        if !reasons.is_empty() {
            return Err(ConfigError::ValidationError { reasons });
        }

        let mut warnings = Vec::new();
        if self.retention_secs < 60 {
            warnings.push(ConfigWarning::ShortRetention {
                secs: self.retention_secs,
            });
        }
        Ok(warnings)
    }
}
