// SPDX-License-Identifier: MIT OR Apache-2.0
//! Control-plane message envelopes.
//!
//! Every control message is a JSON object with `version`, an uppercase
//! `type` tag, `delegationId`, and type-specific fields. The four types
//! are INVITE, ACCEPT, START, and ERROR; anything else is rejected at
//! parse time.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorRecord;
use crate::handle::{TransportHandle, TransportKind};
use crate::{
    EnvironmentManifest, ExecutorConstraints, ExecutorWorkDir, Lease, LeaseConfig, PROTOCOL_VERSION,
    TaskSpec,
};

/// A complete control message as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    /// Protocol version; currently always `"1"`.
    pub version: String,
    /// Delegation this message belongs to.
    pub delegation_id: Uuid,
    /// Type tag plus type-specific fields.
    #[serde(flatten)]
    pub body: ControlBody,
}

impl ControlMessage {
    /// Wrap a body in an envelope stamped with the current version.
    #[must_use]
    pub fn new(delegation_id: Uuid, body: ControlBody) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            delegation_id,
            body,
        }
    }

    /// The uppercase type tag of this message.
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self.body {
            ControlBody::Invite(_) => "INVITE",
            ControlBody::Accept(_) => "ACCEPT",
            ControlBody::Start(_) => "START",
            ControlBody::Error(_) => "ERROR",
        }
    }
}

/// Type-specific payload of a [`ControlMessage`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type")]
pub enum ControlBody {
    /// Offer a delegation.
    #[serde(rename = "INVITE")]
    Invite(InviteBody),
    /// Accept a delegation offer.
    #[serde(rename = "ACCEPT")]
    Accept(AcceptBody),
    /// Grant the lease and hand over the transport handle.
    #[serde(rename = "START")]
    Start(StartBody),
    /// Refuse or abort with a typed error.
    #[serde(rename = "ERROR")]
    Error(ErrorRecord),
}

/// Transport requirement carried in INVITE.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransportRequirements {
    /// The transport the executor must support for this delegation.
    pub transport: TransportKind,
}

/// Credential claim attached to INVITE when the executor requires auth.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthClaim {
    /// Claim type (currently only `"token"`).
    #[serde(rename = "type")]
    pub claim_type: String,
    /// Credential material.
    pub credential: String,
}

/// INVITE payload.
///
/// The environment section carries [`crate::ResourceManifestEntry`]
/// projections only — resource source paths never leave the delegator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InviteBody {
    /// Task descriptor.
    pub task: TaskSpec,
    /// Requested lease terms.
    pub lease: LeaseConfig,
    /// Offered resource manifest.
    pub environment: EnvironmentManifest,
    /// Transport the executor must support.
    pub requirements: TransportRequirements,
    /// Optional credential claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthClaim>,
}

/// ACCEPT payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcceptBody {
    /// Work directory the executor allocated.
    pub executor_work_dir: ExecutorWorkDir,
    /// Constraints the executor applies to the delegation.
    pub executor_constraints: ExecutorConstraints,
}

/// START payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartBody {
    /// Granted lease.
    pub lease: Lease,
    /// Transport handle describing how to fetch the environment.
    pub work_dir: TransportHandle,
}
