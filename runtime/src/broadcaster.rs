//! Live views over the ride store.
//!
//! A view subscribes to the change feed first and then queries the full
//! snapshot, so no commit can fall between the two. After that it folds
//! change events into its state and yields a fresh snapshot whenever the
//! visible content changes.
//!
//! The store's feed is at-least-once and may repeat or reorder events. Each
//! view remembers the newest revision of every ride it currently shows and
//! drops events that are not newer. Rides it does not show are forgotten, so
//! the next event for one is checked against the stored document instead.
//! When the feed breaks, the view resubscribes with exponential backoff and
//! re-queries before yielding again, so consumers always receive complete,
//! authoritative snapshots.
//!
//! A feed ends quietly when its session closes. When the store cannot be
//! reached again it yields one [`DispatchError::Unavailable`] and then ends;
//! the consumer should open a new session and start over from its snapshot.

use crate::metrics::FeedMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use async_stream::stream;
use futures::{Stream, StreamExt};
use ride_dispatch_core::DispatchError;
use ride_dispatch_core::account::Account;
use ride_dispatch_core::ride::{RideRequest, RideStatus};
use ride_dispatch_core::store::{
    ChangeStream, Revision, RideChange, RideQuery, RideStore, StoreError, Versioned,
};
use ride_dispatch_core::types::{AccountId, GeoPoint, RideId, VehicleCategory};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;

/// A live view. Ends when its session closes; a final `Err` means the feed
/// could not be restored.
pub type LiveFeed<T> = Pin<Box<dyn Stream<Item = Result<T, DispatchError>> + Send>>;

/// Which `SEARCHING` requests a driver sees.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingFilter {
    /// Viewing driver
    pub driver_id: AccountId,
    /// Driver's vehicle tier
    pub category: VehicleCategory,
    /// Driver's last known position; orders requests nearest first
    pub origin: Option<GeoPoint>,
    /// Hide pickups further than this from `origin`
    pub radius_km: Option<f64>,
}

impl PendingFilter {
    /// Filter for `driver`'s category and position.
    ///
    /// # Errors
    ///
    /// Permission errors unless `driver` is an active, approved,
    /// KYC-verified driver whose registration fits their vehicle category.
    pub fn for_driver(driver: &Account) -> Result<Self, DispatchError> {
        driver.ensure_can_drive()?;
        let category = driver.vehicle_category.ok_or_else(|| {
            DispatchError::permission(format!("driver {} has no vehicle category", driver.id))
        })?;
        driver.ensure_can_serve(category)?;

        Ok(Self {
            driver_id: driver.id,
            category,
            origin: driver.last_location,
            radius_km: None,
        })
    }

    /// Limit to pickups within `radius_km` of the driver.
    #[must_use]
    pub const fn within_km(mut self, radius_km: Option<f64>) -> Self {
        self.radius_km = radius_km;
        self
    }

    /// Whether the driver sees `ride`.
    #[must_use]
    pub fn matches(&self, ride: &RideRequest) -> bool {
        ride.status() == RideStatus::Searching
            && ride.category == self.category
            && ride.rider_id != self.driver_id
            && ride.is_open_to(self.driver_id)
            && self.in_range(ride)
    }

    fn in_range(&self, ride: &RideRequest) -> bool {
        match (self.origin, self.radius_km) {
            (Some(origin), Some(radius)) => ride.pickup_distance_km(&origin) <= radius,
            _ => true,
        }
    }

    /// Nearest pickup first, then oldest.
    fn order(&self, a: &RideRequest, b: &RideRequest) -> Ordering {
        let by_distance = self.origin.map_or(Ordering::Equal, |origin| {
            a.pickup_distance_km(&origin)
                .total_cmp(&b.pickup_distance_km(&origin))
        });
        by_distance
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// Every request currently visible to a driver, nearest first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PendingSnapshot {
    /// Visible requests
    pub rides: Vec<RideRequest>,
}

impl PendingSnapshot {
    /// Number of visible requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.rides.len()
    }

    /// Whether nothing is visible
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rides.is_empty()
    }

    /// Ids in display order
    #[must_use]
    pub fn ids(&self) -> Vec<RideId> {
        self.rides.iter().map(|ride| ride.id).collect()
    }

    /// Whether `id` is visible
    #[must_use]
    pub fn contains(&self, id: RideId) -> bool {
        self.rides.iter().any(|ride| ride.id == id)
    }
}

/// State folded from the change feed.
trait View: Send + 'static {
    type Snapshot: Clone + PartialEq + Send + 'static;

    /// Feed label for metrics
    const FEED: &'static str;

    /// Query rebuilding the full state
    fn query(&self) -> RideQuery;

    /// Whether a change can affect this view
    fn relevant(&self, ride: &RideRequest) -> bool;

    /// Replace the state with a fresh query result
    fn reset(&mut self, rides: Vec<RideRequest>);

    /// Fold in a change newer than anything seen for that ride
    fn apply(&mut self, ride: RideRequest);

    fn snapshot(&self) -> Self::Snapshot;

    /// Whether the ride is part of the current state
    fn holds(&self, id: RideId) -> bool;
}

/// A view plus the newest revision of each ride it holds.
struct Tracked<V> {
    view: V,
    revisions: HashMap<RideId, Revision>,
}

impl<V: View> Tracked<V> {
    fn new(view: V) -> Self {
        Self {
            view,
            revisions: HashMap::new(),
        }
    }

    /// Rebuild from a full query result.
    fn reset(&mut self, docs: Vec<Versioned<RideRequest>>) {
        for doc in &docs {
            let seen = self.revisions.entry(doc.value.id).or_insert(doc.revision);
            *seen = (*seen).max(doc.revision);
        }
        self.view.reset(docs.into_iter().map(|doc| doc.value).collect());
        let view = &self.view;
        self.revisions.retain(|id, _| view.holds(*id));
    }

    /// Fold one feed event in. Returns false when it was dropped.
    async fn fold(&mut self, store: &dyn RideStore, change: RideChange) -> bool {
        let RideChange { ride, revision } = change;
        if !self.view.relevant(&ride) {
            return false;
        }
        let (ride, revision) = match self.revisions.get(&ride.id) {
            Some(seen) if *seen >= revision => {
                FeedMetrics::record_stale();
                return false;
            },
            Some(_) => (ride, revision),
            // Not held: the event may be a replay of an old write.
            None => confirm(store, ride, revision).await,
        };

        let id = ride.id;
        self.view.apply(ride);
        if self.view.holds(id) {
            self.revisions.insert(id, revision);
        } else {
            self.revisions.remove(&id);
        }
        true
    }

    fn tracked(&self) -> usize {
        self.revisions.len()
    }
}

struct PendingView {
    filter: PendingFilter,
    rides: HashMap<RideId, RideRequest>,
}

impl View for PendingView {
    type Snapshot = PendingSnapshot;

    const FEED: &'static str = "pending";

    fn query(&self) -> RideQuery {
        RideQuery::pending(self.filter.category)
    }

    fn relevant(&self, ride: &RideRequest) -> bool {
        ride.category == self.filter.category
    }

    fn reset(&mut self, rides: Vec<RideRequest>) {
        self.rides = rides
            .into_iter()
            .filter(|ride| self.filter.matches(ride))
            .map(|ride| (ride.id, ride))
            .collect();
    }

    fn apply(&mut self, ride: RideRequest) {
        if self.filter.matches(&ride) {
            self.rides.insert(ride.id, ride);
        } else {
            self.rides.remove(&ride.id);
        }
    }

    fn snapshot(&self) -> PendingSnapshot {
        let mut rides: Vec<RideRequest> = self.rides.values().cloned().collect();
        rides.sort_by(|a, b| self.filter.order(a, b));
        PendingSnapshot { rides }
    }

    fn holds(&self, id: RideId) -> bool {
        self.rides.contains_key(&id)
    }
}

struct ActiveView {
    account: AccountId,
    current: Option<RideRequest>,
}

impl View for ActiveView {
    type Snapshot = Option<RideRequest>;

    const FEED: &'static str = "active";

    fn query(&self) -> RideQuery {
        RideQuery::active_for(self.account)
    }

    fn relevant(&self, ride: &RideRequest) -> bool {
        ride.involves(self.account)
    }

    fn reset(&mut self, rides: Vec<RideRequest>) {
        // Newest wins should the store ever hold two.
        self.current = rides.into_iter().last();
    }

    fn apply(&mut self, ride: RideRequest) {
        if ride.status().is_active() {
            self.current = Some(ride);
        } else if self.current.as_ref().is_some_and(|current| current.id == ride.id) {
            self.current = None;
        }
    }

    fn snapshot(&self) -> Option<RideRequest> {
        self.current.clone()
    }

    fn holds(&self, id: RideId) -> bool {
        self.current.as_ref().is_some_and(|current| current.id == id)
    }
}

/// Builds live views over one store.
#[derive(Clone)]
pub struct DispatchBroadcaster {
    store: Arc<dyn RideStore>,
    reconnect: RetryPolicy,
}

impl DispatchBroadcaster {
    /// Broadcaster over `store`; `reconnect` paces resubscription.
    #[must_use]
    pub fn new(store: Arc<dyn RideStore>, reconnect: RetryPolicy) -> Self {
        Self { store, reconnect }
    }

    /// Live set of requests `filter` lets through.
    ///
    /// Yields the initial snapshot (possibly empty), then a new one each time
    /// the set or any visible request changes. Ends once `shutdown` turns
    /// true or its sender is dropped.
    #[must_use]
    pub fn watch_pending(
        &self,
        filter: PendingFilter,
        shutdown: watch::Receiver<bool>,
    ) -> LiveFeed<PendingSnapshot> {
        self.live(
            PendingView {
                filter,
                rides: HashMap::new(),
            },
            shutdown,
        )
    }

    /// Live view of `account`'s assigned, unfinished ride, as rider or
    /// driver. `PAYMENT_PENDING` still counts as active.
    #[must_use]
    pub fn watch_active(
        &self,
        account: AccountId,
        shutdown: watch::Receiver<bool>,
    ) -> LiveFeed<Option<RideRequest>> {
        self.live(
            ActiveView {
                account,
                current: None,
            },
            shutdown,
        )
    }

    fn live<V: View>(
        &self,
        view: V,
        mut shutdown: watch::Receiver<bool>,
    ) -> LiveFeed<V::Snapshot> {
        let store = Arc::clone(&self.store);
        let reconnect = self.reconnect.clone();

        Box::pin(stream! {
            let mut state = Tracked::new(view);
            let mut last: Option<V::Snapshot> = None;
            let mut breaks = 0usize;

            'session: loop {
                if *shutdown.borrow() {
                    break;
                }

                let query = state.view.query();
                let connected = tokio::select! {
                    _ = shutdown.changed() => None,
                    result = retry_with_predicate(
                        &reconnect,
                        || connect(store.as_ref(), query.clone()),
                        |error: &StoreError| error.is_transient(),
                    ) => Some(result),
                };
                let (mut feed, docs) = match connected {
                    None => break,
                    Some(Ok(connection)) => connection,
                    Some(Err(error)) => {
                        tracing::error!(feed = V::FEED, %error, "Live feed could not be restored");
                        yield Err(DispatchError::Unavailable(format!(
                            "{} feed could not be restored: {error}",
                            V::FEED
                        )));
                        break;
                    },
                };

                state.reset(docs);
                let snapshot = state.view.snapshot();
                if last.as_ref() != Some(&snapshot) {
                    FeedMetrics::record_snapshot(V::FEED);
                    last = Some(snapshot.clone());
                    yield Ok(snapshot);
                }

                loop {
                    let event = tokio::select! {
                        _ = shutdown.changed() => FeedEvent::Shutdown,
                        item = feed.next() => FeedEvent::Item(item),
                    };

                    let change = match event {
                        FeedEvent::Shutdown => break 'session,
                        FeedEvent::Item(Some(Ok(change))) => change,
                        FeedEvent::Item(broken) => {
                            if let Some(Err(error)) = broken {
                                tracing::warn!(feed = V::FEED, %error, "Change feed broke, resubscribing");
                            }
                            breaks += 1;
                            if breaks > reconnect.max_retries {
                                tracing::error!(feed = V::FEED, breaks, "Change feed keeps breaking, giving up");
                                yield Err(DispatchError::Unavailable(format!(
                                    "{} feed broke {breaks} times in a row",
                                    V::FEED
                                )));
                                break 'session;
                            }
                            FeedMetrics::record_reconnect(V::FEED);
                            let delay = reconnect.delay_for_attempt(breaks - 1);
                            let stopped = tokio::select! {
                                _ = shutdown.changed() => true,
                                () = tokio::time::sleep(delay) => false,
                            };
                            if stopped {
                                break 'session;
                            }
                            continue 'session;
                        },
                    };

                    breaks = 0;
                    if !state.fold(store.as_ref(), change).await {
                        continue;
                    }

                    let snapshot = state.view.snapshot();
                    if last.as_ref() != Some(&snapshot) {
                        FeedMetrics::record_snapshot(V::FEED);
                        last = Some(snapshot.clone());
                        yield Ok(snapshot);
                    }
                }
            }

            tracing::debug!(feed = V::FEED, tracked = state.tracked(), "Live feed ended");
        })
    }
}

impl std::fmt::Debug for DispatchBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchBroadcaster")
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

enum FeedEvent {
    Shutdown,
    Item(Option<Result<RideChange, StoreError>>),
}

/// Subscribe first, then query, so nothing committed in between is missed.
async fn connect(
    store: &dyn RideStore,
    query: RideQuery,
) -> Result<(ChangeStream, Vec<Versioned<RideRequest>>), StoreError> {
    let feed = store.subscribe().await?;
    let docs = store.query_rides(query).await?;
    Ok((feed, docs))
}

/// Prefer the stored document when it is at least as new as the event.
async fn confirm(store: &dyn RideStore, ride: RideRequest, revision: Revision) -> (RideRequest, Revision) {
    match store.load_ride(ride.id).await {
        Ok(Some(doc)) if doc.revision >= revision => {
            if doc.revision > revision {
                FeedMetrics::record_stale();
            }
            (doc.value, doc.revision)
        },
        Ok(_) => (ride, revision),
        Err(error) => {
            tracing::debug!(ride_id = %ride.id, %error, "Could not confirm change, using the event");
            (ride, revision)
        },
    }
}
