//! Live pending and active-trip feeds through sessions.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use common::{Harness, WAIT, sample_bid};
use futures::{Stream, StreamExt};
use ride_dispatch_core::{DispatchError, ErrorKind};
use ride_dispatch_core::ride::RideStatus;
use ride_dispatch_core::store::{Revision, RideChange};
use ride_dispatch_core::types::{Actor, GeoPoint, VehicleCategory};
use ride_dispatch_runtime::PendingSnapshot;
use ride_dispatch_testing::AccountBuilder;
use std::time::Duration;

async fn next<S, T>(feed: &mut S) -> T
where
    S: Stream<Item = Result<T, DispatchError>> + Unpin,
{
    tokio::time::timeout(WAIT, feed.next())
        .await
        .expect("feed yielded in time")
        .expect("feed still open")
        .expect("feed healthy")
}

async fn quiet<S, T>(feed: &mut S)
where
    S: Stream<Item = T> + Unpin,
    T: std::fmt::Debug,
{
    let result = tokio::time::timeout(Duration::from_millis(100), feed.next()).await;
    assert!(result.is_err(), "unexpected snapshot: {result:?}");
}

#[tokio::test]
async fn drivers_see_requests_appear_and_disappear() {
    let harness = Harness::new();
    let rider = harness.seed(AccountBuilder::rider("Meera").build());
    let watcher = harness.seed(AccountBuilder::driver("Ravi", VehicleCategory::Mini).build());
    let racer = harness.seed(AccountBuilder::driver("Kiran", VehicleCategory::Mini).build());

    let session = harness.engine.open_session(Actor::Driver(watcher.id)).await.unwrap();
    let mut pending = session.pending_requests().await.unwrap();
    assert_eq!(next(&mut pending).await, PendingSnapshot::default());

    let ride = harness.post_ride(&rider, VehicleCategory::Mini, 250).await;
    let snapshot = next(&mut pending).await;
    assert_eq!(snapshot.ids(), vec![ride.id]);

    harness.engine.accept(&Actor::Driver(racer.id), ride.id).await.unwrap();
    assert!(next(&mut pending).await.is_empty());
}

#[tokio::test]
async fn other_categories_and_targets_stay_hidden() {
    let harness = Harness::new();
    let meera = harness.seed(AccountBuilder::rider("Meera").build());
    let anil = harness.seed(AccountBuilder::rider("Anil").build());
    let watcher = harness.seed(AccountBuilder::driver("Ravi", VehicleCategory::Mini).build());
    let chosen = harness.seed(AccountBuilder::driver("Kiran", VehicleCategory::Mini).build());

    let session = harness.engine.open_session(Actor::Driver(watcher.id)).await.unwrap();
    let mut pending = session.pending_requests().await.unwrap();
    next(&mut pending).await;

    harness.post_ride(&meera, VehicleCategory::Suv, 400).await;
    harness
        .engine
        .propose_bid(
            &Actor::Rider(anil.id),
            sample_bid(VehicleCategory::Mini, Some(300)).targeted_at(chosen.id),
        )
        .await
        .unwrap();

    quiet(&mut pending).await;
}

#[tokio::test]
async fn nearest_pickup_is_listed_first() {
    let harness = Harness::new();
    let near_rider = harness.seed(AccountBuilder::rider("Meera").build());
    let far_rider = harness.seed(AccountBuilder::rider("Anil").build());
    let watcher = harness.seed(
        AccountBuilder::driver("Ravi", VehicleCategory::Mini)
            .at(GeoPoint::new(27.52, 77.70))
            .build(),
    );

    let far = harness.post_ride(&far_rider, VehicleCategory::Mini, 250).await;
    let mut near_bid = sample_bid(VehicleCategory::Mini, Some(260));
    near_bid.pickup.point = GeoPoint::new(27.515, 77.695);
    let near = harness
        .engine
        .propose_bid(&Actor::Rider(near_rider.id), near_bid)
        .await
        .unwrap();

    let session = harness.engine.open_session(Actor::Driver(watcher.id)).await.unwrap();
    let mut pending = session.pending_requests().await.unwrap();
    assert_eq!(next(&mut pending).await.ids(), vec![near.id, far.id]);
}

#[tokio::test]
async fn stale_and_duplicate_events_are_ignored() {
    let harness = Harness::new();
    let rider = harness.seed(AccountBuilder::rider("Meera").build());
    let other_rider = harness.seed(AccountBuilder::rider("Anil").build());
    let watcher = harness.seed(AccountBuilder::driver("Ravi", VehicleCategory::Mini).build());
    let racer = harness.seed(AccountBuilder::driver("Kiran", VehicleCategory::Mini).build());

    let ride = harness.post_ride(&rider, VehicleCategory::Mini, 250).await;
    harness.engine.accept(&Actor::Driver(racer.id), ride.id).await.unwrap();

    let session = harness.engine.open_session(Actor::Driver(watcher.id)).await.unwrap();
    let mut pending = session.pending_requests().await.unwrap();
    assert!(next(&mut pending).await.is_empty());

    // The SEARCHING copy replayed at its original revision.
    harness.store.inject_change(RideChange {
        ride: ride.clone(),
        revision: Revision::FIRST,
    });
    quiet(&mut pending).await;

    let fresh = harness.post_ride(&other_rider, VehicleCategory::Mini, 270).await;
    harness.store.inject_change(RideChange {
        ride: fresh.clone(),
        revision: Revision::FIRST,
    });
    assert_eq!(next(&mut pending).await.ids(), vec![fresh.id]);
    quiet(&mut pending).await;
}

#[tokio::test]
async fn feeds_resubscribe_and_catch_up_after_a_disconnect() {
    let harness = Harness::new();
    let rider = harness.seed(AccountBuilder::rider("Meera").build());
    let watcher = harness.seed(AccountBuilder::driver("Ravi", VehicleCategory::Mini).build());

    let session = harness.engine.open_session(Actor::Driver(watcher.id)).await.unwrap();
    let mut pending = session.pending_requests().await.unwrap();
    next(&mut pending).await;

    harness.store.disconnect_feeds();
    // Committed while the feed is down; picked up by the re-query.
    let ride = harness.post_ride(&rider, VehicleCategory::Mini, 250).await;

    assert_eq!(next(&mut pending).await.ids(), vec![ride.id]);
    assert_eq!(harness.store.subscriber_count(), 1);
}

#[tokio::test]
async fn feeds_report_when_the_store_stays_down() {
    let mut config = common::test_config();
    config.feed.reconnect_max_retries = 2;
    let harness = Harness::build(
        config,
        std::sync::Arc::new(ride_dispatch_testing::mocks::StaticFareEstimator::flat(180, 6)),
    );
    let watcher = harness.seed(AccountBuilder::driver("Ravi", VehicleCategory::Mini).build());

    let session = harness.engine.open_session(Actor::Driver(watcher.id)).await.unwrap();
    let mut pending = session.pending_requests().await.unwrap();
    next(&mut pending).await;

    harness.store.set_unavailable(true);
    harness.store.disconnect_feeds();

    let failure = tokio::time::timeout(WAIT, pending.next())
        .await
        .expect("feed gave up in time")
        .expect("failure is reported before the feed ends");
    assert_eq!(failure.unwrap_err().kind(), ErrorKind::Unavailable);
    let ended = tokio::time::timeout(WAIT, pending.next()).await.unwrap();
    assert!(ended.is_none());
}

#[tokio::test]
async fn closing_the_session_ends_its_feeds() {
    let harness = Harness::new();
    let watcher = harness.seed(AccountBuilder::driver("Ravi", VehicleCategory::Mini).build());

    let session = harness.engine.open_session(Actor::Driver(watcher.id)).await.unwrap();
    let mut pending = session.pending_requests().await.unwrap();
    let mut active = session.active_trip();
    next(&mut pending).await;
    assert_eq!(next(&mut active).await, None);

    session.close();

    let ended = tokio::time::timeout(WAIT, pending.next()).await.unwrap();
    assert!(ended.is_none());
    let ended = tokio::time::timeout(WAIT, active.next()).await.unwrap();
    assert!(ended.is_none());
}

#[tokio::test]
async fn riders_follow_their_active_trip() {
    let harness = Harness::new();
    let rider = harness.seed(AccountBuilder::rider("Meera").build());
    let driver = harness.seed(AccountBuilder::driver("Ravi", VehicleCategory::Mini).build());

    let session = harness.engine.open_session(Actor::Rider(rider.id)).await.unwrap();
    let mut active = session.active_trip();
    assert_eq!(next(&mut active).await, None);

    let ride = harness.post_ride(&rider, VehicleCategory::Mini, 250).await;
    let driver_actor = Actor::Driver(driver.id);
    harness.engine.accept(&driver_actor, ride.id).await.unwrap();
    let accepted = next(&mut active).await.expect("trip is active");
    assert_eq!(accepted.status(), RideStatus::Accepted);
    assert_eq!(accepted.driver_id(), Some(driver.id));

    harness.engine.mark_arrived(&driver_actor, ride.id).await.unwrap();
    assert_eq!(next(&mut active).await.map(|ride| ride.status()), Some(RideStatus::Arrived));

    harness.engine.cancel_trip(&driver_actor, ride.id, "rider not at pickup").await.unwrap();
    assert_eq!(next(&mut active).await, None);
}

#[tokio::test]
async fn pending_feeds_are_for_drivers_only() {
    let harness = Harness::new();
    let rider = harness.seed(AccountBuilder::rider("Meera").build());
    let unapproved = harness.seed(AccountBuilder::driver("Kiran", VehicleCategory::Mini).unapproved().build());
    let deactivated = harness.seed(AccountBuilder::rider("Anil").deactivated().build());

    let session = harness.engine.open_session(Actor::Rider(rider.id)).await.unwrap();
    let refused = session.pending_requests().await.err().unwrap();
    assert_eq!(refused.kind(), ErrorKind::Permission);

    let session = harness.engine.open_session(Actor::Driver(unapproved.id)).await.unwrap();
    let refused = session.pending_requests().await.err().unwrap();
    assert_eq!(refused.kind(), ErrorKind::Permission);

    let refused = harness.engine.open_session(Actor::Rider(deactivated.id)).await.unwrap_err();
    assert_eq!(refused.kind(), ErrorKind::Permission);

    let refused = harness.engine.open_session(Actor::Driver(rider.id)).await.unwrap_err();
    assert_eq!(refused.kind(), ErrorKind::Permission);
}
