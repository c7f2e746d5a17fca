//! In-memory [`RideStore`] with genuine compare-and-set semantics.
//!
//! One mutex guards every document, so a batch validates all of its
//! preconditions and applies all of its writes without any other commit
//! interleaving. That gives the same guarantees as the Postgres store's
//! transaction, which is what the acceptance race tests rely on.
//!
//! Fault injection covers the failure paths the engine has to survive:
//! an unreachable store, failing commits, slow commits, a dropped change
//! feed, and duplicate or stale change events.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use async_stream::stream;
use ride_dispatch_core::account::Account;
use ride_dispatch_core::ledger::WalletTransaction;
use ride_dispatch_core::ride::RideRequest;
use ride_dispatch_core::store::{
    ChangeStream, CommitReceipt, DocumentKey, Revision, RideChange, RideQuery, RideStore,
    StoreError, StoreFuture, Versioned, WriteBatch, WriteOp,
};
use ride_dispatch_core::types::{AccountId, RideId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const DEFAULT_FEED_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Inner {
    rides: HashMap<RideId, Versioned<RideRequest>>,
    accounts: HashMap<AccountId, Versioned<Account>>,
    ledger: Vec<WalletTransaction>,
    feed: broadcast::Sender<RideChange>,
    feed_capacity: usize,
    unavailable: bool,
    failing_commits: u32,
    commit_delay: Option<Duration>,
    commits: u64,
}

/// In-memory ride store for fast, deterministic tests.
///
/// Clones share the same documents.
///
/// # Example
///
/// ```
/// use ride_dispatch_testing::InMemoryRideStore;
/// use ride_dispatch_testing::fixtures::AccountBuilder;
/// use ride_dispatch_core::store::{Revision, RideStore};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryRideStore::new();
/// let rider = AccountBuilder::rider("Meera").build();
/// let revision = store.seed_account(rider.clone());
/// assert_eq!(revision, Revision::FIRST);
///
/// let loaded = store.load_account(rider.id).await.unwrap();
/// assert_eq!(loaded.map(|doc| doc.value), Some(rider));
/// # });
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryRideStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryRideStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    /// Create a store whose change feed buffers `capacity` events per
    /// subscriber before the subscriber is considered lagging.
    #[must_use]
    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Mutex::new(Inner {
                rides: HashMap::new(),
                accounts: HashMap::new(),
                ledger: Vec::new(),
                feed,
                feed_capacity: capacity.max(1),
                unavailable: false,
                failing_commits: 0,
                commit_delay: None,
                commits: 0,
            })),
        }
    }

    /// Insert or overwrite an account without any revision check.
    pub fn seed_account(&self, account: Account) -> Revision {
        let mut inner = self.inner.lock().unwrap();
        let revision = inner
            .accounts
            .get(&account.id)
            .map_or(Revision::FIRST, |doc| doc.revision.next());
        inner
            .accounts
            .insert(account.id, Versioned::new(revision, account));
        revision
    }

    /// Insert or overwrite a ride without any revision check. Emits a change.
    pub fn seed_ride(&self, ride: RideRequest) -> Revision {
        let mut inner = self.inner.lock().unwrap();
        let revision = inner
            .rides
            .get(&ride.id)
            .map_or(Revision::FIRST, |doc| doc.revision.next());
        inner
            .rides
            .insert(ride.id, Versioned::new(revision, ride.clone()));
        let _ = inner.feed.send(RideChange { ride, revision });
        revision
    }

    /// Current content of a ride
    #[must_use]
    pub fn ride(&self, id: RideId) -> Option<RideRequest> {
        self.inner
            .lock()
            .unwrap()
            .rides
            .get(&id)
            .map(|doc| doc.value.clone())
    }

    /// Current content of an account
    #[must_use]
    pub fn account(&self, id: AccountId) -> Option<Account> {
        self.inner
            .lock()
            .unwrap()
            .accounts
            .get(&id)
            .map(|doc| doc.value.clone())
    }

    /// Every ledger entry, in commit order
    #[must_use]
    pub fn ledger_entries(&self) -> Vec<WalletTransaction> {
        self.inner.lock().unwrap().ledger.clone()
    }

    /// Number of rides stored
    #[must_use]
    pub fn ride_count(&self) -> usize {
        self.inner.lock().unwrap().rides.len()
    }

    /// Number of successful commits so far
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.inner.lock().unwrap().commits
    }

    /// Number of live change feed subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().feed.receiver_count()
    }

    /// Make every operation fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unwrap().unavailable = unavailable;
    }

    /// Fail the next `count` commits with `Unavailable`.
    pub fn fail_next_commits(&self, count: u32) {
        self.inner.lock().unwrap().failing_commits = count;
    }

    /// Delay every commit by `delay` before it takes the lock.
    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        self.inner.lock().unwrap().commit_delay = delay;
    }

    /// Close every open change feed. Subscribers see an `Unavailable` error
    /// and must resubscribe.
    pub fn disconnect_feeds(&self) {
        let mut inner = self.inner.lock().unwrap();
        let (feed, _) = broadcast::channel(inner.feed_capacity);
        inner.feed = feed;
    }

    /// Push an arbitrary change event, e.g. a duplicate or a stale revision.
    pub fn inject_change(&self, change: RideChange) {
        let _ = self.inner.lock().unwrap().feed.send(change);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.inner.lock().unwrap().unavailable {
            Err(StoreError::Unavailable("in-memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn apply(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
        }
        if inner.failing_commits > 0 {
            inner.failing_commits -= 1;
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }

        validate(&inner, &batch)?;

        let mut receipt = CommitReceipt::default();
        let mut changes = Vec::new();
        for op in batch.into_ops() {
            match op {
                WriteOp::PutRide { ride, .. } => {
                    let revision = inner
                        .rides
                        .get(&ride.id)
                        .map_or(Revision::FIRST, |doc| doc.revision.next());
                    receipt.rides.push((ride.id, revision));
                    changes.push(RideChange {
                        ride: ride.clone(),
                        revision,
                    });
                    inner.rides.insert(ride.id, Versioned::new(revision, ride));
                },
                WriteOp::PutAccount { account, .. } => {
                    let revision = inner
                        .accounts
                        .get(&account.id)
                        .map_or(Revision::FIRST, |doc| doc.revision.next());
                    receipt.accounts.push((account.id, revision));
                    inner
                        .accounts
                        .insert(account.id, Versioned::new(revision, account));
                },
                WriteOp::AppendLedger(entry) => inner.ledger.push(entry),
            }
        }
        inner.commits += 1;

        for change in changes {
            // No subscribers is fine.
            let _ = inner.feed.send(change);
        }
        Ok(receipt)
    }
}

/// Check every precondition of `batch` before anything is written.
fn validate(inner: &Inner, batch: &WriteBatch) -> Result<(), StoreError> {
    let mut touched = HashSet::new();
    let mut settled_rides = HashSet::new();

    for op in batch.ops() {
        match op {
            WriteOp::PutRide { ride, expected } => {
                let key = DocumentKey::Ride(ride.id);
                if !touched.insert(key) {
                    return Err(StoreError::Database(format!("batch writes {key} twice")));
                }
                let actual = inner.rides.get(&ride.id).map(|doc| doc.revision);
                if actual != *expected {
                    return Err(StoreError::ConcurrencyConflict {
                        document: key,
                        expected: *expected,
                        actual,
                    });
                }
            },
            WriteOp::PutAccount { account, expected } => {
                let key = DocumentKey::Account(account.id);
                if !touched.insert(key) {
                    return Err(StoreError::Database(format!("batch writes {key} twice")));
                }
                let actual = inner.accounts.get(&account.id).map(|doc| doc.revision);
                if actual != *expected {
                    return Err(StoreError::ConcurrencyConflict {
                        document: key,
                        expected: *expected,
                        actual,
                    });
                }
            },
            WriteOp::AppendLedger(entry) => {
                let exists = inner
                    .ledger
                    .iter()
                    .any(|existing| existing.ride_id == entry.ride_id && existing.kind == entry.kind);
                if exists || !settled_rides.insert((entry.ride_id, entry.kind)) {
                    return Err(StoreError::DuplicateLedgerEntry {
                        ride_id: entry.ride_id,
                    });
                }
            },
        }
    }
    Ok(())
}

fn change_stream(mut receiver: broadcast::Receiver<RideChange>) -> ChangeStream {
    Box::pin(stream! {
        loop {
            match receiver.recv().await {
                Ok(change) => yield Ok(change),
                Err(RecvError::Lagged(missed)) => {
                    yield Err(StoreError::Unavailable(format!(
                        "change feed lagged by {missed} events"
                    )));
                    break;
                },
                Err(RecvError::Closed) => {
                    yield Err(StoreError::Unavailable("change feed closed".to_string()));
                    break;
                },
            }
        }
    })
}

impl Default for InMemoryRideStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RideStore for InMemoryRideStore {
    fn load_ride(&self, id: RideId) -> StoreFuture<'_, Option<Versioned<RideRequest>>> {
        Box::pin(async move {
            self.ensure_available()?;
            Ok(self.inner.lock().unwrap().rides.get(&id).cloned())
        })
    }

    fn load_account(&self, id: AccountId) -> StoreFuture<'_, Option<Versioned<Account>>> {
        Box::pin(async move {
            self.ensure_available()?;
            Ok(self.inner.lock().unwrap().accounts.get(&id).cloned())
        })
    }

    fn query_rides(&self, query: RideQuery) -> StoreFuture<'_, Vec<Versioned<RideRequest>>> {
        Box::pin(async move {
            self.ensure_available()?;
            let mut rides: Vec<_> = self
                .inner
                .lock()
                .unwrap()
                .rides
                .values()
                .filter(|doc| query.matches(&doc.value))
                .cloned()
                .collect();
            rides.sort_by_key(|doc| (doc.value.created_at, doc.value.id));
            Ok(rides)
        })
    }

    fn commit(&self, batch: WriteBatch) -> StoreFuture<'_, CommitReceipt> {
        Box::pin(async move {
            let delay = self.inner.lock().unwrap().commit_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.apply(batch)
        })
    }

    fn ledger(&self, account: AccountId) -> StoreFuture<'_, Vec<WalletTransaction>> {
        Box::pin(async move {
            self.ensure_available()?;
            Ok(self
                .inner
                .lock()
                .unwrap()
                .ledger
                .iter()
                .filter(|entry| entry.account_id == account)
                .cloned()
                .collect())
        })
    }

    fn subscribe(&self) -> StoreFuture<'_, ChangeStream> {
        Box::pin(async move {
            self.ensure_available()?;
            let receiver = self.inner.lock().unwrap().feed.subscribe();
            Ok(change_stream(receiver))
        })
    }
}
