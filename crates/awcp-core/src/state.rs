// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lifecycle state machines for delegations and assignments.
//!
//! Both machines are pure transition tables: [`delegation_next`] and
//! [`assignment_next`] compute the successor state for an event or fail
//! with [`StateError::IllegalTransition`] without side effects. The
//! record types in the crate root layer persistence and timestamps on
//! top of these tables.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Delegation lifecycle
// ---------------------------------------------------------------------------

/// Delegator-side lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DelegationState {
    /// Record exists; INVITE not yet sent.
    Created,
    /// INVITE sent, awaiting ACCEPT.
    Invited,
    /// ACCEPT received; transport not yet prepared.
    Accepted,
    /// START sent, awaiting the executor's first status event.
    Started,
    /// Executor reported the task running.
    Running,
    /// Terminal: task finished successfully.
    Completed,
    /// Terminal: a protocol or task failure was recorded.
    Error,
    /// Terminal: cancelled from the delegator side.
    Cancelled,
    /// Terminal: the lease expired before completion.
    Expired,
}

/// Events that drive a [`DelegationState`] forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DelegationEvent {
    /// INVITE handed to the executor client.
    SendInvite,
    /// ACCEPT arrived.
    ReceiveAccept,
    /// START handed to the executor client.
    SendStart,
    /// First executor status event arrived.
    SetupComplete,
    /// Terminal `done` event arrived.
    ReceiveDone,
    /// Terminal `error` event arrived (or was synthesized locally).
    ReceiveError,
    /// Cancellation requested by the delegator.
    Cancel,
    /// The lease-expiry sweep fired.
    Expire,
}

impl DelegationState {
    /// Returns `true` for the four terminal states.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::Cancelled | Self::Expired
        )
    }

    /// Returns the set of states reachable from `self` in one legal step.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [DelegationState] {
        match self {
            Self::Created => &[
                Self::Invited,
                Self::Error,
                Self::Cancelled,
                Self::Expired,
            ],
            Self::Invited => &[
                Self::Accepted,
                Self::Error,
                Self::Cancelled,
                Self::Expired,
            ],
            Self::Accepted => &[
                Self::Started,
                Self::Error,
                Self::Cancelled,
                Self::Expired,
            ],
            Self::Started => &[
                Self::Running,
                Self::Completed,
                Self::Error,
                Self::Cancelled,
                Self::Expired,
            ],
            Self::Running => &[
                Self::Completed,
                Self::Error,
                Self::Cancelled,
                Self::Expired,
            ],
            Self::Completed | Self::Error | Self::Cancelled | Self::Expired => &[],
        }
    }

    /// Returns `true` if moving from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition_to(&self, next: DelegationState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for DelegationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Invited => "invited",
            Self::Accepted => "accepted",
            Self::Started => "started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Compute the successor of `state` for `event`.
///
/// # Errors
///
/// [`StateError::IllegalTransition`] when the event is not legal in the
/// given state. The caller's state is never mutated by this function.
pub fn delegation_next(
    state: DelegationState,
    event: DelegationEvent,
) -> Result<DelegationState, StateError> {
    use DelegationEvent as E;
    use DelegationState as S;

    let next = match (state, event) {
        (S::Created, E::SendInvite) => S::Invited,
        (S::Invited, E::ReceiveAccept) => S::Accepted,
        (S::Accepted, E::SendStart) => S::Started,
        (S::Started, E::SetupComplete) => S::Running,
        // `done` straight out of `started` is tolerated: a trivial task can
        // finish before its first status event is observed.
        (S::Running | S::Started, E::ReceiveDone) => S::Completed,
        (s, E::ReceiveError) if !s.is_terminal() => S::Error,
        (s, E::Cancel) if !s.is_terminal() => S::Cancelled,
        (s, E::Expire) if !s.is_terminal() => S::Expired,
        (s, e) => {
            return Err(StateError::IllegalTransition {
                state: s.to_string(),
                event: format!("{e:?}"),
            });
        }
    };
    Ok(next)
}

// ---------------------------------------------------------------------------
// Assignment lifecycle
// ---------------------------------------------------------------------------

/// Executor-side lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentState {
    /// INVITE accepted, awaiting START.
    Pending,
    /// Task running.
    Active,
    /// Terminal: task finished successfully.
    Completed,
    /// Terminal: the task or transport failed.
    Error,
    /// Terminal: cancelled by the delegator (or the sweep).
    Cancelled,
}

/// Events that drive an [`AssignmentState`] forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssignmentEvent {
    /// START arrived.
    ReceiveStart,
    /// The task executor returned successfully.
    TaskComplete,
    /// The task executor failed.
    TaskFail,
    /// A protocol-level ERROR arrived.
    ReceiveError,
    /// Cancellation requested.
    Cancel,
}

impl AssignmentState {
    /// Returns `true` for the three terminal states.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Returns the set of states reachable from `self` in one legal step.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [AssignmentState] {
        match self {
            Self::Pending => &[Self::Active, Self::Error, Self::Cancelled],
            Self::Active => &[Self::Completed, Self::Error, Self::Cancelled],
            Self::Completed | Self::Error | Self::Cancelled => &[],
        }
    }

    /// Returns `true` if moving from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition_to(&self, next: AssignmentState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for AssignmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Compute the successor of `state` for `event`; see [`delegation_next`].
///
/// # Errors
///
/// [`StateError::IllegalTransition`] when the event is not legal in the
/// given state.
pub fn assignment_next(
    state: AssignmentState,
    event: AssignmentEvent,
) -> Result<AssignmentState, StateError> {
    use AssignmentEvent as E;
    use AssignmentState as S;

    let next = match (state, event) {
        (S::Pending, E::ReceiveStart) => S::Active,
        (S::Active, E::TaskComplete) => S::Completed,
        (S::Active, E::TaskFail) => S::Error,
        (s, E::ReceiveError) if !s.is_terminal() => S::Error,
        (s, E::Cancel) if !s.is_terminal() => S::Cancelled,
        (s, e) => {
            return Err(StateError::IllegalTransition {
                state: s.to_string(),
                event: format!("{e:?}"),
            });
        }
    };
    Ok(next)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure applying a lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// The event is not legal in the current state.
    #[error("illegal transition: {event} in state {state}")]
    IllegalTransition {
        /// State at the time of the attempt.
        state: String,
        /// The offending event.
        event: String,
    },
}
