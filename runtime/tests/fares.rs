//! Estimates, fallbacks and bids.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use common::{Harness, sample_bid, test_config};
use ride_dispatch_core::fare::{FareEstimate, FareTable};
use ride_dispatch_core::ride::RideStatus;
use ride_dispatch_core::ErrorKind;
use ride_dispatch_core::types::{Actor, GeoPoint, Location, VehicleCategory};
use ride_dispatch_runtime::{FareQuote, QuoteSource};
use ride_dispatch_runtime::circuit_breaker::State;
use ride_dispatch_runtime::fare::DistanceFareEstimator;
use ride_dispatch_testing::AccountBuilder;
use ride_dispatch_testing::fixtures::{SAMPLE_CODE, drop_point, pickup_point};
use ride_dispatch_testing::mocks::{FailingFareEstimator, StaticFareEstimator};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn distance_estimate_prices_every_category() {
    let config = test_config();
    let harness = Harness::build(config.clone(), Arc::new(DistanceFareEstimator::new(config.fare)));

    let quote = harness
        .engine
        .estimate(GeoPoint::new(27.49, 77.67), GeoPoint::new(27.50, 77.68))
        .await
        .unwrap();

    assert_eq!(quote.source, QuoteSource::Live);
    let mini = quote.get(VehicleCategory::Mini).unwrap();
    assert!(mini.amount > 0);
    assert!(mini.eta_minutes > 0);
    assert_eq!(quote.table.missing().count(), 0);
}

#[tokio::test]
async fn bid_creates_a_searching_request_at_the_offered_fare() {
    let harness = Harness::new();
    let rider = harness.seed(AccountBuilder::rider("Meera").build());

    let ride = harness.post_ride(&rider, VehicleCategory::Mini, 250).await;

    assert_eq!(ride.status(), RideStatus::Searching);
    assert_eq!(ride.fare, 250);
    assert_eq!(ride.trip_code.as_str(), SAMPLE_CODE);
    assert_eq!(ride.trip_code.as_str().len(), 6);
    assert_eq!(harness.store.ride(ride.id), Some(ride));
}

#[tokio::test]
async fn bid_without_an_amount_takes_the_estimate() {
    let harness = Harness::with_estimator(Arc::new(StaticFareEstimator::flat(175, 5)));
    let rider = harness.seed(AccountBuilder::rider("Meera").build());

    let ride = harness
        .engine
        .propose_bid(&Actor::Rider(rider.id), sample_bid(VehicleCategory::Auto, None))
        .await
        .unwrap();

    assert_eq!(ride.fare, 175);
}

#[tokio::test]
async fn invalid_bids_are_rejected_without_writing() {
    let harness = Harness::new();
    let rider = harness.seed(AccountBuilder::rider("Meera").build());
    let actor = Actor::Rider(rider.id);

    for amount in [0, -40] {
        let result = harness
            .engine
            .propose_bid(&actor, sample_bid(VehicleCategory::Mini, Some(amount)))
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation, "amount {amount}");
    }

    let mut same_place = sample_bid(VehicleCategory::Mini, Some(200));
    same_place.drop.point = same_place.pickup.point;
    let result = harness.engine.propose_bid(&actor, same_place).await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);

    let mut off_map = sample_bid(VehicleCategory::Mini, Some(200));
    off_map.pickup.point = GeoPoint::new(91.0, 77.0);
    let result = harness.engine.propose_bid(&actor, off_map).await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);

    let mut rambling = sample_bid(VehicleCategory::Mini, Some(200));
    rambling.drop.address = "Gali ".repeat(Location::MAX_ADDRESS_LEN);
    let result = harness.engine.propose_bid(&actor, rambling).await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);

    assert_eq!(harness.store.ride_count(), 0);
}

#[tokio::test]
async fn riders_hold_one_open_request_at_a_time() {
    let harness = Harness::new();
    let rider = harness.seed(AccountBuilder::rider("Meera").build());
    harness.post_ride(&rider, VehicleCategory::Mini, 250).await;

    let second = harness
        .engine
        .propose_bid(&Actor::Rider(rider.id), sample_bid(VehicleCategory::Sedan, Some(300)))
        .await;

    assert_eq!(second.unwrap_err().kind(), ErrorKind::Conflict);
    assert_eq!(harness.store.ride_count(), 1);
}

#[tokio::test]
async fn concurrent_bids_from_one_rider_create_one_request() {
    let harness = Harness::new();
    let rider = harness.seed(AccountBuilder::rider("Meera").build());
    let actor = Actor::Rider(rider.id);

    let (a, b) = tokio::join!(
        harness.engine.propose_bid(&actor, sample_bid(VehicleCategory::Mini, Some(250))),
        harness.engine.propose_bid(&actor, sample_bid(VehicleCategory::Auto, Some(150))),
    );

    assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);
    assert_eq!(harness.store.ride_count(), 1);
}

#[tokio::test]
async fn only_riders_place_bids() {
    let harness = Harness::new();
    let driver = harness.seed(AccountBuilder::driver("Ravi", VehicleCategory::Mini).build());

    let as_driver = harness
        .engine
        .propose_bid(&Actor::Driver(driver.id), sample_bid(VehicleCategory::Mini, Some(250)))
        .await;
    assert_eq!(as_driver.unwrap_err().kind(), ErrorKind::Permission);

    let claimed = harness
        .engine
        .propose_bid(&Actor::Rider(driver.id), sample_bid(VehicleCategory::Mini, Some(250)))
        .await;
    assert_eq!(claimed.unwrap_err().kind(), ErrorKind::Permission);
}

#[tokio::test]
async fn bids_cannot_target_ineligible_drivers() {
    let harness = Harness::new();
    let rider = harness.seed(AccountBuilder::rider("Meera").build());
    let offline = harness.seed(AccountBuilder::driver("Ravi", VehicleCategory::Mini).offline().build());
    let wrong_tier = harness.seed(AccountBuilder::driver("Kiran", VehicleCategory::Bike).build());
    let actor = Actor::Rider(rider.id);

    for target in [&offline, &wrong_tier] {
        let result = harness
            .engine
            .propose_bid(&actor, sample_bid(VehicleCategory::Mini, Some(250)).targeted_at(target.id))
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Permission, "{}", target.name);
    }
    assert_eq!(harness.store.ride_count(), 0);
}

#[tokio::test]
async fn failing_estimator_falls_back_to_the_configured_table() {
    let estimator = FailingFareEstimator::new();
    let harness = Harness::with_estimator(Arc::new(estimator.clone()));

    let quote = harness.engine.estimate(pickup_point(), drop_point()).await.unwrap();

    assert_eq!(quote.source, QuoteSource::Fallback);
    let expected = FareQuote {
        table: harness.engine.config().fare.fallback_table(),
        source: QuoteSource::Fallback,
    };
    assert_eq!(quote, expected);
    assert_eq!(estimator.calls(), 1);
}

#[tokio::test]
async fn bids_still_post_while_the_estimator_is_down() {
    let harness = Harness::with_estimator(Arc::new(FailingFareEstimator::new()));
    let rider = harness.seed(AccountBuilder::rider("Meera").build());

    let ride = harness
        .engine
        .propose_bid(&Actor::Rider(rider.id), sample_bid(VehicleCategory::Mini, None))
        .await
        .unwrap();

    assert_eq!(ride.fare, harness.engine.config().fare.fallback(VehicleCategory::Mini).amount);
}

#[tokio::test]
async fn slow_estimator_times_out_into_the_fallback() {
    let mut config = test_config();
    config.fare.estimator_timeout_ms = 20;
    let estimator = StaticFareEstimator::flat(180, 6).delayed(Duration::from_millis(500));
    let harness = Harness::build(config, Arc::new(estimator));

    let quote = harness.engine.estimate(pickup_point(), drop_point()).await.unwrap();

    assert_eq!(quote.source, QuoteSource::Fallback);
}

#[tokio::test]
async fn missing_categories_are_filled_from_the_fallback() {
    let mut table = FareTable::new();
    table.insert(VehicleCategory::Mini, FareEstimate {
        amount: 200,
        eta_minutes: 4,
    });
    let harness = Harness::with_estimator(Arc::new(StaticFareEstimator::new(table)));

    let quote = harness.engine.estimate(pickup_point(), drop_point()).await.unwrap();

    assert_eq!(quote.source, QuoteSource::Partial);
    assert_eq!(quote.get(VehicleCategory::Mini).map(|e| e.amount), Some(200));
    assert_eq!(
        quote.get(VehicleCategory::Suv),
        Some(harness.engine.config().fare.fallback(VehicleCategory::Suv))
    );
}

#[tokio::test]
async fn repeated_failures_open_the_circuit() {
    let estimator = FailingFareEstimator::new();
    let harness = Harness::with_estimator(Arc::new(estimator.clone()));
    let threshold = harness.engine.config().fare.breaker_failure_threshold;

    for _ in 0..threshold + 3 {
        let quote = harness.engine.estimate(pickup_point(), drop_point()).await.unwrap();
        assert_eq!(quote.source, QuoteSource::Fallback);
    }

    assert_eq!(usize::try_from(estimator.calls()).unwrap(), threshold);
    assert_eq!(harness.engine.fares().breaker().state().await, State::Open);
}
