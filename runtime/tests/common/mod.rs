//! Shared wiring for the engine integration tests.

#![allow(dead_code)] // Each test binary uses a different subset
#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code can use unwrap/expect

use ride_dispatch_core::account::Account;
use ride_dispatch_core::fare::FareEstimator;
use ride_dispatch_core::ride::{RideRequest, TripCode};
use ride_dispatch_core::types::{Actor, Location, VehicleCategory};
use ride_dispatch_runtime::{BidRequest, DispatchConfig, DispatchEngine};
use ride_dispatch_testing::fixtures::{SAMPLE_CODE, drop_point, pickup_point};
use ride_dispatch_testing::mocks::{FixedCodeGenerator, RecordingNotifier, StaticFareEstimator};
use ride_dispatch_testing::{InMemoryRideStore, init_test_tracing, test_clock};
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(2);

/// Engine over an in-memory store, with every collaborator observable.
pub struct Harness {
    pub engine: DispatchEngine,
    pub store: InMemoryRideStore,
    pub notifier: RecordingNotifier,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_estimator(Arc::new(StaticFareEstimator::flat(180, 6)))
    }

    pub fn with_estimator(estimator: Arc<dyn FareEstimator>) -> Self {
        Self::build(test_config(), estimator)
    }

    pub fn build(config: DispatchConfig, estimator: Arc<dyn FareEstimator>) -> Self {
        init_test_tracing();
        let store = InMemoryRideStore::new();
        let notifier = RecordingNotifier::new();
        let engine = DispatchEngine::builder()
            .config(config)
            .store(Arc::new(store.clone()))
            .estimator(estimator)
            .notifier(Arc::new(notifier.clone()))
            .clock(Arc::new(test_clock()))
            .codes(Arc::new(FixedCodeGenerator::new(
                SAMPLE_CODE.parse::<TripCode>().expect("sample code"),
            )))
            .build()
            .expect("engine builds");

        Self {
            engine,
            store,
            notifier,
        }
    }

    pub fn seed(&self, account: Account) -> Account {
        self.store.seed_account(account.clone());
        account
    }

    /// Cash bid between the sample points.
    pub async fn post_ride(&self, rider: &Account, category: VehicleCategory, fare: i64) -> RideRequest {
        self.engine
            .propose_bid(&Actor::Rider(rider.id), sample_bid(category, Some(fare)))
            .await
            .expect("bid accepted")
    }

    /// Drive a ride from `SEARCHING` to the end of the trip.
    pub async fn complete_trip(&self, ride: &RideRequest, driver: &Account) -> RideRequest {
        let actor = Actor::Driver(driver.id);
        let outcome = self.engine.accept(&actor, ride.id).await.expect("accept");
        assert!(outcome.is_won());
        self.engine.mark_arrived(&actor, ride.id).await.expect("arrive");
        self.engine
            .start_trip(&actor, ride.id, SAMPLE_CODE)
            .await
            .expect("start");
        self.engine.end_trip(&actor, ride.id).await.expect("end")
    }

    pub fn account(&self, account: &Account) -> Account {
        self.store.account(account.id).expect("account exists")
    }
}

/// Defaults with fast feed reconnects.
pub fn test_config() -> DispatchConfig {
    let mut config = DispatchConfig::default();
    config.feed.reconnect_initial_ms = 5;
    config.feed.reconnect_max_ms = 20;
    config
}

pub fn sample_bid(category: VehicleCategory, amount: Option<i64>) -> BidRequest {
    BidRequest::new(
        Location::new(pickup_point(), "Mathura Junction"),
        Location::new(drop_point(), "Krishna Janmabhoomi"),
        category,
        amount,
    )
}
