// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transport handles: the opaque, typed payload the executor needs to
//! fetch — and later return — the environment contents.
//!
//! The handle is a tagged sum keyed by `transport`; each side dispatches
//! on the discriminator and rejects kinds it has no adapter for.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// TransportKind
// ---------------------------------------------------------------------------

/// Data-plane transport discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Point-in-time archive shipped inline or in chunks.
    Archive,
    /// Remote mount of the delegator's environment (live sync).
    Mount,
    /// Pre-signed object-storage URLs.
    Storage,
    /// Version-control branch push/pull.
    Branch,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Archive => "archive",
            Self::Mount => "mount",
            Self::Storage => "storage",
            Self::Branch => "branch",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// What a transport's data channel can do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransportCapabilities {
    /// Executor mutations appear directly at the delegator's source;
    /// snapshots are disabled and the snapshot policy coerces to `auto`.
    pub live_sync: bool,
    /// The executor can emit a point-in-time archive at completion.
    pub supports_snapshots: bool,
    /// The handle supports multi-part transfer with per-chunk checksums.
    pub chunked: bool,
}

// ---------------------------------------------------------------------------
// Handle payloads
// ---------------------------------------------------------------------------

/// Multi-part transfer descriptor for chunked archive handles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedDescriptor {
    /// Number of chunks that will be uploaded.
    pub chunk_count: u32,
    /// Size of every chunk except possibly the last, in bytes.
    pub chunk_bytes: u64,
}

/// Short-lived credential embedded in mount / branch handles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransportCredential {
    /// Credential material (opaque to the protocol).
    pub secret: String,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
}

/// The opaque, typed payload carried in START's `workDir` field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportHandle {
    /// Archive payload: inline base64 or a chunked descriptor, plus the
    /// SHA-256 of the assembled archive. Exactly one of `archiveBase64`
    /// and `chunked` is present.
    #[serde(rename_all = "camelCase")]
    Archive {
        /// Hex SHA-256 of the complete archive.
        sha256: String,
        /// Inline payload (small archives).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        archive_base64: Option<String>,
        /// Chunked transfer descriptor (large archives).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunked: Option<ChunkedDescriptor>,
    },

    /// Mounted-filesystem handle.
    #[serde(rename_all = "camelCase")]
    Mount {
        /// Endpoint the executor connects to.
        endpoint: String,
        /// Remote export locator.
        export: String,
        /// Short-lived mount credential.
        credential: TransportCredential,
    },

    /// Object-storage handle with pre-signed URLs.
    #[serde(rename_all = "camelCase")]
    Storage {
        /// URL to download the environment archive.
        download_url: String,
        /// URL to upload the snapshot archive.
        upload_url: String,
        /// Hex SHA-256 of the downloadable archive.
        sha256: String,
        /// URL expiry instant.
        expires_at: DateTime<Utc>,
        /// Extra request headers, if the provider requires them.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },

    /// Version-control branch handle.
    #[serde(rename_all = "camelCase")]
    Branch {
        /// Repository URL.
        repository_url: String,
        /// Branch carrying the environment contents.
        branch: String,
        /// Commit the branch was cut from.
        base_commit: String,
        /// Short-lived repository credential.
        credential: TransportCredential,
    },
}

impl TransportHandle {
    /// The discriminator of this handle.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Archive { .. } => TransportKind::Archive,
            Self::Mount { .. } => TransportKind::Mount,
            Self::Storage { .. } => TransportKind::Storage,
            Self::Branch { .. } => TransportKind::Branch,
        }
    }
}
