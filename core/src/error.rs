//! Error taxonomy for the dispatch engine.
//!
//! Every fallible engine operation returns [`DispatchError`]. The variants are
//! specific enough to log and to show to a caller; [`DispatchError::kind`]
//! folds them into the five categories clients branch on.

use crate::store::StoreError;
use crate::types::{AccountId, RideId, Role};
use crate::ride::RideStatus;
use thiserror::Error;

/// Coarse classification of a [`DispatchError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input (bad amount, bad coordinates, wrong trip code)
    Validation,
    /// The ride or account is not in a state that allows the operation
    Conflict,
    /// The caller may not perform the operation
    Permission,
    /// A collaborator (store, estimator) is unreachable or timed out
    Unavailable,
    /// The addressed ride or account does not exist
    NotFound,
}

/// Errors surfaced by dispatch operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// Input rejected before touching any state.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The supplied one-time code does not match the ride's code.
    #[error("Trip code does not match for ride {0}")]
    TripCodeMismatch(RideId),

    /// The command is not legal from the ride's current status.
    #[error("Cannot {command} ride {ride_id} while {status}")]
    InvalidTransition {
        /// Ride the command targeted
        ride_id: RideId,
        /// Status the ride was in
        status: RideStatus,
        /// Command name
        command: &'static str,
    },

    /// State-dependent rejection that is not a status edge (already rated,
    /// driver busy, rider already has an open request).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Caller is not the driver assigned to the ride.
    #[error("Account {actor} is not the assigned driver of ride {ride_id}")]
    NotAssignedDriver {
        /// Ride in question
        ride_id: RideId,
        /// Calling account
        actor: AccountId,
    },

    /// Caller is not the ride's rider.
    #[error("Account {actor} is not the rider of ride {ride_id}")]
    NotRider {
        /// Ride in question
        ride_id: RideId,
        /// Calling account
        actor: AccountId,
    },

    /// Account does not hold the role it acted under.
    #[error("Account {account} does not hold role {role}")]
    RoleRequired {
        /// Calling account
        account: AccountId,
        /// Role required
        role: Role,
    },

    /// Any other authorization failure (unapproved driver, deactivated
    /// account, category mismatch).
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Ride does not exist.
    #[error("Ride not found: {0}")]
    RideNotFound(RideId),

    /// Account does not exist.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Operation did not finish within its deadline.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        /// Operation name
        operation: &'static str,
        /// Deadline in milliseconds
        after_ms: u64,
    },

    /// Store or another collaborator is unreachable.
    #[error("Unavailable: {0}")]
    Unavailable(String),
}

impl DispatchError {
    /// Category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::TripCodeMismatch(_) => ErrorKind::Validation,
            Self::InvalidTransition { .. } | Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotAssignedDriver { .. }
            | Self::NotRider { .. }
            | Self::RoleRequired { .. }
            | Self::Permission(_) => ErrorKind::Permission,
            Self::RideNotFound(_) | Self::AccountNotFound(_) => ErrorKind::NotFound,
            Self::Timeout { .. } | Self::Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Unavailable)
    }

    /// Shorthand for a [`DispatchError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Shorthand for a [`DispatchError::Conflict`].
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Shorthand for a [`DispatchError::Permission`].
    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission(message.into())
    }
}

impl From<StoreError> for DispatchError {
    fn from(error: StoreError) -> Self {
        match error {
            // Callers that can resolve a conflict (arbiter, lifecycle retry loop)
            // match on StoreError before it gets here.
            StoreError::ConcurrencyConflict { document, .. } => {
                Self::Conflict(format!("{document} was modified concurrently"))
            },
            StoreError::DuplicateLedgerEntry { ride_id } => {
                Self::Conflict(format!("ride {ride_id} already settled"))
            },
            StoreError::RideNotFound(id) => Self::RideNotFound(id),
            StoreError::AccountNotFound(id) => Self::AccountNotFound(id),
            StoreError::Unavailable(message)
            | StoreError::Database(message)
            | StoreError::Serialization(message) => Self::Unavailable(message),
        }
    }
}
