// SPDX-License-Identifier: MIT OR Apache-2.0
//! Protocol error taxonomy.
//!
//! Every failure that crosses a process boundary — an ERROR control
//! message, an `error` task event, a terminal error record, an HTTP error
//! body — carries one of these codes. The wire strings are stable;
//! internal errors are promoted into an [`ErrorRecord`] at the boundary
//! rather than unwound across it.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Protocol-visible error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ── Admission (delegator) ─────────────────────────────────────────
    /// A resource source path does not exist.
    WorkspaceNotFound,
    /// A resource source path is not a directory.
    WorkspaceInvalid,
    /// The resource tree exceeds an admission threshold.
    WorkspaceTooLarge,
    /// The resource tree contains files matching a sensitive pattern.
    SensitiveFiles,

    // ── Acceptance (executor) ─────────────────────────────────────────
    /// A tool the requested transport needs is not installed.
    DependencyMissing,
    /// The allocated work path escapes the executor's work directory.
    WorkdirDenied,
    /// The executor's admission policy refused the INVITE.
    Declined,

    // ── Execution ─────────────────────────────────────────────────────
    /// The user task executor failed.
    TaskFailed,
    /// Transport setup, chunk transfer, or snapshot application failed.
    TransportError,
    /// The event stream failed mid-task (delegator-internal).
    SseFailed,
    /// Cancellation was requested; terminal but not an operational fault.
    Cancelled,
    /// An archive checksum did not match its payload.
    ChecksumMismatch,

    // ── Lookup ────────────────────────────────────────────────────────
    /// The referenced delegation or assignment is unknown.
    NotFound,
}

impl ErrorCode {
    /// The stable wire string (e.g. `"WORKSPACE_TOO_LARGE"`).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::WorkspaceNotFound => "WORKSPACE_NOT_FOUND",
            Self::WorkspaceInvalid => "WORKSPACE_INVALID",
            Self::WorkspaceTooLarge => "WORKSPACE_TOO_LARGE",
            Self::SensitiveFiles => "SENSITIVE_FILES",
            Self::DependencyMissing => "DEPENDENCY_MISSING",
            Self::WorkdirDenied => "WORKDIR_DENIED",
            Self::Declined => "DECLINED",
            Self::TaskFailed => "TASK_FAILED",
            Self::TransportError => "TRANSPORT_ERROR",
            Self::SseFailed => "SSE_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::NotFound => "NOT_FOUND",
        }
    }

    /// Which side of the protocol originates the code.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::WorkspaceNotFound
            | Self::WorkspaceInvalid
            | Self::WorkspaceTooLarge
            | Self::SensitiveFiles => "admission",

            Self::DependencyMissing | Self::WorkdirDenied | Self::Declined => "acceptance",

            Self::TaskFailed
            | Self::TransportError
            | Self::SseFailed
            | Self::Cancelled
            | Self::ChecksumMismatch => "execution",

            Self::NotFound => "lookup",
        }
    }

    /// Short human-readable description.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::WorkspaceNotFound => "A resource source path does not exist",
            Self::WorkspaceInvalid => "A resource source path is not a directory",
            Self::WorkspaceTooLarge => "The resource tree exceeds an admission threshold",
            Self::SensitiveFiles => "The resource tree contains sensitive files",
            Self::DependencyMissing => "A tool required by the transport is not installed",
            Self::WorkdirDenied => "The allocated work path escapes the work directory",
            Self::Declined => "The executor's admission policy refused the invite",
            Self::TaskFailed => "The task executor failed",
            Self::TransportError => "Transport setup or transfer failed",
            Self::SseFailed => "The task event stream failed mid-task",
            Self::Cancelled => "The delegation was cancelled",
            Self::ChecksumMismatch => "An archive checksum did not match its payload",
            Self::NotFound => "The referenced delegation is unknown",
        }
    }

    /// Returns `true` for codes that represent an operational fault (as
    /// opposed to a requested cancellation).
    #[must_use]
    pub fn is_fault(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl std::error::Error for ErrorCode {}

// ---------------------------------------------------------------------------
// ErrorRecord
// ---------------------------------------------------------------------------

/// The wire and persistence shape of a protocol failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("[{code}] {message}")]
pub struct ErrorRecord {
    /// Stable machine-readable code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Optional remediation hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorRecord {
    /// Create a record with no hint.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hint: None,
        }
    }

    /// Attach a remediation hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Shorthand for a [`ErrorCode::Cancelled`] record.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "delegation cancelled")
    }
}
