//! Document store abstraction for rides, accounts and the wallet ledger.
//!
//! Every document carries a [`Revision`]. Writes state the revision they
//! expect, and a [`WriteBatch`] commits all of its operations or none of
//! them. That is the only concurrency primitive the engine relies on:
//!
//! - acceptance is a single-ride conditional put,
//! - settlement and rating are ride + account (+ ledger) batches,
//! - the change feed pushes every committed ride with its new revision.
//!
//! # Implementations
//!
//! - `PostgresRideStore` (in `ride-dispatch-postgres`): revision-checked
//!   updates inside one SQL transaction, `LISTEN/NOTIFY` change feed
//! - `InMemoryRideStore` (in `ride-dispatch-testing`): mutex-guarded maps
//!   with the same semantics, plus fault injection
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` so the engine can hold an
//! `Arc<dyn RideStore>`.

use crate::account::Account;
use crate::ledger::WalletTransaction;
use crate::ride::{RideRequest, RideStatus};
use crate::types::{AccountId, RideId, VehicleCategory};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Monotonic per-document revision. A new document is written at 1.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision(u64);

impl Revision {
    /// Revision of a freshly inserted document.
    pub const FIRST: Self = Self(1);

    /// Create a `Revision` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the revision number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The revision after this one.
    ///
    /// # Overflow Behavior
    ///
    /// Saturates at `u64::MAX`; no document is written that often.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A document together with the revision it was read at.
#[derive(Clone, Debug, PartialEq)]
pub struct Versioned<T> {
    /// Revision at read time
    pub revision: Revision,
    /// The document
    pub value: T,
}

impl<T> Versioned<T> {
    /// Pairs a value with its revision.
    pub const fn new(revision: Revision, value: T) -> Self {
        Self { revision, value }
    }
}

/// Addresses a single document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocumentKey {
    /// A ride request
    Ride(RideId),
    /// An account
    Account(AccountId),
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ride(id) => write!(f, "ride/{id}"),
            Self::Account(id) => write!(f, "account/{id}"),
        }
    }
}

/// Errors that can occur during store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A write's expected revision did not match the stored one.
    ///
    /// `expected: None` means the write was an insert and the document
    /// already existed; `actual: None` means the document did not exist.
    #[error("Concurrency conflict on {document}: expected {expected:?}, found {actual:?}")]
    ConcurrencyConflict {
        /// Conflicting document
        document: DocumentKey,
        /// Revision the write expected
        expected: Option<Revision>,
        /// Revision actually stored
        actual: Option<Revision>,
    },

    /// A second `TRIP_EARNING` entry for the same ride.
    #[error("Ledger already holds a trip earning for ride {ride_id}")]
    DuplicateLedgerEntry {
        /// Ride already settled
        ride_id: RideId,
    },

    /// Ride does not exist.
    #[error("Ride not found: {0}")]
    RideNotFound(RideId),

    /// Account does not exist.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Store unreachable; nothing was written.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Whether this is a revision conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Whether retrying later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// One operation inside a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    /// Write a ride; `expected: None` inserts and fails if it exists.
    PutRide {
        /// New ride content
        ride: RideRequest,
        /// Revision the stored ride must be at
        expected: Option<Revision>,
    },
    /// Write an account; `expected: None` inserts and fails if it exists.
    PutAccount {
        /// New account content
        account: Account,
        /// Revision the stored account must be at
        expected: Option<Revision>,
    },
    /// Append a ledger entry.
    AppendLedger(WalletTransaction),
}

/// Operations committed atomically: every precondition holds and every
/// write lands, or nothing changes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// An empty batch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Conditionally replace a ride read at `expected`.
    #[must_use]
    pub fn put_ride(mut self, ride: RideRequest, expected: Revision) -> Self {
        self.ops.push(WriteOp::PutRide {
            ride,
            expected: Some(expected),
        });
        self
    }

    /// Insert a ride that must not exist yet.
    #[must_use]
    pub fn insert_ride(mut self, ride: RideRequest) -> Self {
        self.ops.push(WriteOp::PutRide {
            ride,
            expected: None,
        });
        self
    }

    /// Conditionally replace an account read at `expected`.
    #[must_use]
    pub fn put_account(mut self, account: Account, expected: Revision) -> Self {
        self.ops.push(WriteOp::PutAccount {
            account,
            expected: Some(expected),
        });
        self
    }

    /// Insert an account that must not exist yet.
    #[must_use]
    pub fn insert_account(mut self, account: Account) -> Self {
        self.ops.push(WriteOp::PutAccount {
            account,
            expected: None,
        });
        self
    }

    /// Append a ledger entry.
    #[must_use]
    pub fn append_ledger(mut self, entry: WalletTransaction) -> Self {
        self.ops.push(WriteOp::AppendLedger(entry));
        self
    }

    /// Operations in order
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consumes the batch
    #[must_use]
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    /// Number of operations
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// New revisions assigned by a successful commit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Rides written and their new revisions
    pub rides: Vec<(RideId, Revision)>,
    /// Accounts written and their new revisions
    pub accounts: Vec<(AccountId, Revision)>,
}

impl CommitReceipt {
    /// New revision of a ride written by the batch.
    #[must_use]
    pub fn ride_revision(&self, id: RideId) -> Option<Revision> {
        self.rides
            .iter()
            .find(|(ride_id, _)| *ride_id == id)
            .map(|(_, revision)| *revision)
    }

    /// New revision of an account written by the batch.
    #[must_use]
    pub fn account_revision(&self, id: AccountId) -> Option<Revision> {
        self.accounts
            .iter()
            .find(|(account_id, _)| *account_id == id)
            .map(|(_, revision)| *revision)
    }
}

/// Filter for ride queries. Empty `statuses` matches every status.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RideQuery {
    /// Statuses to include
    pub statuses: Vec<RideStatus>,
    /// Only this category
    pub category: Option<VehicleCategory>,
    /// Only rides where this account is rider or assigned driver
    pub participant: Option<AccountId>,
}

impl RideQuery {
    /// `SEARCHING` rides of one category.
    #[must_use]
    pub fn pending(category: VehicleCategory) -> Self {
        Self {
            statuses: vec![RideStatus::Searching],
            category: Some(category),
            participant: None,
        }
    }

    /// Non-terminal rides the account takes part in, `SEARCHING` included.
    #[must_use]
    pub fn open_for(account: AccountId) -> Self {
        let mut statuses = vec![RideStatus::Searching];
        statuses.extend(RideStatus::ACTIVE);
        Self {
            statuses,
            category: None,
            participant: Some(account),
        }
    }

    /// Assigned, unfinished rides the account takes part in.
    #[must_use]
    pub fn active_for(account: AccountId) -> Self {
        Self {
            statuses: RideStatus::ACTIVE.to_vec(),
            category: None,
            participant: Some(account),
        }
    }

    /// Whether `ride` passes the filter.
    #[must_use]
    pub fn matches(&self, ride: &RideRequest) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&ride.status()))
            && self.category.is_none_or(|category| ride.category == category)
            && self.participant.is_none_or(|account| ride.involves(account))
    }
}

/// A committed ride write, as pushed by the change feed.
#[derive(Clone, Debug, PartialEq)]
pub struct RideChange {
    /// Ride content after the commit
    pub ride: RideRequest,
    /// Revision the commit produced
    pub revision: Revision,
}

/// Live feed of ride changes. At-least-once; may repeat or reorder events.
/// An `Err` item means the feed broke and the consumer should resubscribe.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<RideChange, StoreError>> + Send>>;

/// Boxed future returned by [`RideStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Persistent store of rides, accounts and wallet entries.
///
/// Implementations must be `Send + Sync`; the engine shares one store across
/// every task.
pub trait RideStore: Send + Sync {
    /// Load a ride with its revision. `Ok(None)` if it does not exist.
    ///
    /// # Errors
    ///
    /// `Unavailable`, `Database` or `Serialization` on store failure.
    fn load_ride(&self, id: RideId) -> StoreFuture<'_, Option<Versioned<RideRequest>>>;

    /// Load an account with its revision. `Ok(None)` if it does not exist.
    ///
    /// # Errors
    ///
    /// `Unavailable`, `Database` or `Serialization` on store failure.
    fn load_account(&self, id: AccountId) -> StoreFuture<'_, Option<Versioned<Account>>>;

    /// Rides matching `query`, oldest first.
    ///
    /// # Errors
    ///
    /// `Unavailable`, `Database` or `Serialization` on store failure.
    fn query_rides(&self, query: RideQuery) -> StoreFuture<'_, Vec<Versioned<RideRequest>>>;

    /// Commit a batch atomically.
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict`: an expected revision did not match
    /// - `DuplicateLedgerEntry`: the ride already has a trip earning
    /// - `Unavailable` / `Database`: nothing was written
    fn commit(&self, batch: WriteBatch) -> StoreFuture<'_, CommitReceipt>;

    /// Ledger entries of an account, oldest first.
    ///
    /// # Errors
    ///
    /// `Unavailable` or `Database` on store failure.
    fn ledger(&self, account: AccountId) -> StoreFuture<'_, Vec<WalletTransaction>>;

    /// Subscribe to ride changes committed from now on.
    ///
    /// # Errors
    ///
    /// `Unavailable` if the feed cannot be opened.
    fn subscribe(&self) -> StoreFuture<'_, ChangeStream>;

    /// Single-document conditional update of a ride.
    ///
    /// # Errors
    ///
    /// `ConcurrencyConflict` if the ride is no longer at `expected`.
    fn compare_and_set_ride(&self, ride: RideRequest, expected: Revision) -> StoreFuture<'_, Revision> {
        Box::pin(async move {
            let id = ride.id;
            let receipt = self.commit(WriteBatch::new().put_ride(ride, expected)).await?;
            receipt
                .ride_revision(id)
                .ok_or_else(|| StoreError::Database(format!("commit did not report ride {id}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ride::{RideDraft, TripCode};
    use crate::types::{GeoPoint, Location, PaymentMethod, RidePreferences};
    use chrono::Utc;

    #[allow(clippy::expect_used)] // Panics: Test will fail if the code is malformed
    fn ride(rider_id: AccountId, category: VehicleCategory) -> RideRequest {
        RideRequest::searching(
            RideDraft {
                rider_id,
                pickup: Location::new(GeoPoint::new(12.97, 77.59), "MG Road"),
                drop: Location::new(GeoPoint::new(12.93, 77.62), "Koramangala"),
                category,
                fare: 180,
                payment_method: PaymentMethod::Upi,
                preferences: RidePreferences::default(),
                target_driver_id: None,
            },
            TripCode::from_number(123_456).expect("six digits"),
            Utc::now(),
        )
    }

    #[test]
    fn revisions_advance() {
        assert_eq!(Revision::FIRST.next(), Revision::new(2));
        assert_eq!(Revision::new(u64::MAX).next().value(), u64::MAX);
    }

    #[test]
    fn pending_query_filters_category_and_status() {
        let rider = AccountId::new();
        let query = RideQuery::pending(VehicleCategory::Auto);

        assert!(query.matches(&ride(rider, VehicleCategory::Auto)));
        assert!(!query.matches(&ride(rider, VehicleCategory::Suv)));
    }

    #[test]
    fn open_query_matches_the_rider() {
        let rider = AccountId::new();
        assert!(RideQuery::open_for(rider).matches(&ride(rider, VehicleCategory::Bike)));
        assert!(!RideQuery::open_for(AccountId::new()).matches(&ride(rider, VehicleCategory::Bike)));
        assert!(!RideQuery::active_for(rider).matches(&ride(rider, VehicleCategory::Bike)));
    }

    #[test]
    fn batch_records_operations_in_order() {
        let rider = AccountId::new();
        let batch = WriteBatch::new()
            .insert_ride(ride(rider, VehicleCategory::Mini))
            .put_ride(ride(rider, VehicleCategory::Mini), Revision::FIRST);

        assert_eq!(batch.len(), 2);
        assert!(matches!(batch.ops()[0], WriteOp::PutRide { expected: None, .. }));
        assert!(matches!(
            batch.ops()[1],
            WriteOp::PutRide {
                expected: Some(Revision::FIRST),
                ..
            }
        ));
    }

    #[test]
    fn receipt_looks_up_revisions() {
        let id = RideId::new();
        let receipt = CommitReceipt {
            rides: vec![(id, Revision::new(3))],
            accounts: vec![],
        };
        assert_eq!(receipt.ride_revision(id), Some(Revision::new(3)));
        assert_eq!(receipt.ride_revision(RideId::new()), None);
    }
}
