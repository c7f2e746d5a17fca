//! Read-compute-commit with optimistic retry.
//!
//! Every write in the engine reads documents with their revisions, computes
//! the new state, and commits with those revisions as preconditions. A
//! revision conflict means someone else committed in between; the whole
//! cycle runs again against fresh reads. Any other error ends the operation.

use crate::metrics::DispatchMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use ride_dispatch_core::DispatchError;
use ride_dispatch_core::account::Account;
use ride_dispatch_core::ride::RideRequest;
use ride_dispatch_core::store::{RideStore, StoreError, Versioned};
use ride_dispatch_core::types::{AccountId, RideId};
use std::future::Future;
use thiserror::Error;

/// Failure of a single attempt.
#[derive(Error, Debug)]
pub(crate) enum AttemptError {
    /// Rejected by a guard; never retried
    #[error(transparent)]
    Rejected(#[from] DispatchError),
    /// Store failure; retried only when it is a revision conflict
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AttemptError {
    const fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(error) if error.is_conflict())
    }
}

impl From<AttemptError> for DispatchError {
    fn from(error: AttemptError) -> Self {
        match error {
            AttemptError::Rejected(error) => error,
            AttemptError::Store(error) => error.into(),
        }
    }
}

/// Run `attempt` until it succeeds, fails for a reason other than a
/// revision conflict, or `policy` runs out.
pub(crate) async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, attempt: F) -> Result<T, DispatchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    retry_with_predicate(policy, attempt, |error| {
        let conflict = error.is_conflict();
        if conflict {
            DispatchMetrics::record_conflict();
        }
        conflict
    })
    .await
    .map_err(DispatchError::from)
}

pub(crate) async fn load_ride(store: &dyn RideStore, id: RideId) -> Result<Versioned<RideRequest>, AttemptError> {
    store
        .load_ride(id)
        .await?
        .ok_or(AttemptError::Rejected(DispatchError::RideNotFound(id)))
}

pub(crate) async fn load_account(store: &dyn RideStore, id: AccountId) -> Result<Versioned<Account>, AttemptError> {
    store
        .load_account(id)
        .await?
        .ok_or(AttemptError::Rejected(DispatchError::AccountNotFound(id)))
}
