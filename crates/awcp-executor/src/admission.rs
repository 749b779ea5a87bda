// SPDX-License-Identifier: MIT OR Apache-2.0
//! Acceptance policy applied to incoming INVITEs.

use awcp_config::ExecutorConfig;
use awcp_core::error::{ErrorCode, ErrorRecord};
use awcp_core::message::InviteBody;

/// Decides whether an INVITE is accepted.
pub struct AdmissionPolicy {
    max_concurrent: usize,
    required_auth: Option<String>,
}

impl AdmissionPolicy {
    /// Build the policy from executor configuration.
    #[must_use]
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            required_auth: config.required_auth.clone(),
        }
    }

    /// Check an INVITE against concurrency and auth policy.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Declined`] with a hint naming the refused dimension.
    pub fn check(&self, invite: &InviteBody, active_count: usize) -> Result<(), ErrorRecord> {
        if active_count >= self.max_concurrent {
            return Err(ErrorRecord::new(
                ErrorCode::Declined,
                format!(
                    "executor at capacity ({active_count}/{} active assignments)",
                    self.max_concurrent
                ),
            )
            .with_hint("retry once a running assignment finishes"));
        }

        if let Some(required) = &self.required_auth {
            let presented = invite.auth.as_ref().map(|a| a.credential.as_str());
            if presented != Some(required.as_str()) {
                return Err(ErrorRecord::new(
                    ErrorCode::Declined,
                    "missing or invalid credential",
                )
                .with_hint("include the executor's auth token in the INVITE"));
            }
        }

        Ok(())
    }
}
