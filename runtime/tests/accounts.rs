//! Signup, approval, availability and deactivation.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use common::Harness;
use ride_dispatch_core::ErrorKind;
use ride_dispatch_core::ride::RideStatus;
use ride_dispatch_core::types::{Actor, Gender, GeoPoint, Role, VehicleCategory};
use ride_dispatch_runtime::Registration;
use ride_dispatch_testing::AccountBuilder;

#[tokio::test]
async fn registration_creates_an_unapproved_account() {
    let harness = Harness::new();

    let driver = harness
        .engine
        .accounts()
        .register(Registration::driver("  Ravi ", VehicleCategory::Sedan, Gender::Male).with_role(Role::Rider))
        .await
        .unwrap();

    assert_eq!(driver.name, "Ravi");
    assert!(driver.roles.contains(&Role::Driver));
    assert!(driver.roles.contains(&Role::Rider));
    assert!(!driver.approved);
    assert!(!driver.online);
    assert!(driver.active);
    assert_eq!(driver.wallet_balance, 0);
    assert_eq!(harness.store.account(driver.id), Some(driver));
}

#[tokio::test]
async fn invalid_registrations_are_rejected() {
    let harness = Harness::new();
    let accounts = harness.engine.accounts();

    let blank = accounts.register(Registration::rider("   ")).await;
    assert_eq!(blank.unwrap_err().kind(), ErrorKind::Validation);

    let mut no_vehicle = Registration::driver("Ravi", VehicleCategory::Mini, Gender::Male);
    no_vehicle.vehicle_category = None;
    assert_eq!(accounts.register(no_vehicle).await.unwrap_err().kind(), ErrorKind::Validation);

    let pink = Registration::driver("Ravi", VehicleCategory::Pink, Gender::Male);
    assert_eq!(accounts.register(pink).await.unwrap_err().kind(), ErrorKind::Validation);

    let pink = Registration::driver("Asha", VehicleCategory::Pink, Gender::Female);
    assert!(accounts.register(pink).await.is_ok());
}

#[tokio::test]
async fn drivers_go_online_only_once_approved() {
    let harness = Harness::new();
    let admin = harness.seed(AccountBuilder::admin("Ops").build());
    let driver = harness.seed(AccountBuilder::driver("Ravi", VehicleCategory::Mini).unapproved().offline().build());
    let accounts = harness.engine.accounts();
    let actor = Actor::Driver(driver.id);

    let refused = accounts.set_availability(&actor, true).await.unwrap_err();
    assert_eq!(refused.kind(), ErrorKind::Permission);

    accounts
        .set_approval(&Actor::Admin(admin.id), driver.id, true, true)
        .await
        .unwrap();
    let online = accounts.set_availability(&actor, true).await.unwrap();
    assert!(online.online);

    let offline = accounts.set_availability(&actor, false).await.unwrap();
    assert!(!offline.online);
}

#[tokio::test]
async fn revoking_approval_takes_the_driver_offline() {
    let harness = Harness::new();
    let admin = harness.seed(AccountBuilder::admin("Ops").build());
    let driver = harness.seed(AccountBuilder::driver("Ravi", VehicleCategory::Mini).build());

    let revoked = harness
        .engine
        .accounts()
        .set_approval(&Actor::Admin(admin.id), driver.id, false, true)
        .await
        .unwrap();

    assert!(!revoked.approved);
    assert!(!revoked.online);
    assert!(!harness.account(&driver).online);
}

#[tokio::test]
async fn only_administrators_approve_drivers() {
    let harness = Harness::new();
    let rider = harness.seed(AccountBuilder::rider("Meera").build());
    let driver = harness.seed(AccountBuilder::driver("Ravi", VehicleCategory::Mini).unapproved().build());
    let accounts = harness.engine.accounts();

    let refused = accounts
        .set_approval(&Actor::Rider(rider.id), driver.id, true, true)
        .await
        .unwrap_err();
    assert_eq!(refused.kind(), ErrorKind::Permission);

    let impostor = accounts
        .set_approval(&Actor::Admin(rider.id), driver.id, true, true)
        .await
        .unwrap_err();
    assert_eq!(impostor.kind(), ErrorKind::Permission);
    assert!(!harness.account(&driver).approved);
}

#[tokio::test]
async fn location_updates_are_validated() {
    let harness = Harness::new();
    let rider = harness.seed(AccountBuilder::rider("Meera").nowhere().build());
    let accounts = harness.engine.accounts();
    let actor = Actor::Rider(rider.id);

    let invalid = accounts
        .update_location(&actor, GeoPoint::new(12.0, 181.0))
        .await
        .unwrap_err();
    assert_eq!(invalid.kind(), ErrorKind::Validation);

    let point = GeoPoint::new(27.49, 77.67);
    let updated = accounts.update_location(&actor, point).await.unwrap();
    assert_eq!(updated.last_location, Some(point));

    let system = accounts.update_location(&Actor::System, point).await.unwrap_err();
    assert_eq!(system.kind(), ErrorKind::Permission);
}

#[tokio::test]
async fn accounts_with_an_open_ride_cannot_be_deactivated() {
    let harness = Harness::new();
    let rider = harness.seed(AccountBuilder::rider("Meera").build());
    let ride = harness.post_ride(&rider, VehicleCategory::Mini, 250).await;
    let actor = Actor::Rider(rider.id);

    let refused = harness.engine.accounts().deactivate(&actor, rider.id).await.unwrap_err();
    assert_eq!(refused.kind(), ErrorKind::Conflict);

    harness.engine.cancel_search(&actor, ride.id, None).await.unwrap();
    let deactivated = harness.engine.accounts().deactivate(&actor, rider.id).await.unwrap();
    assert!(!deactivated.active);

    let after = harness.engine.open_session(actor).await.unwrap_err();
    assert_eq!(after.kind(), ErrorKind::Permission);
}

#[tokio::test]
async fn deactivation_racing_a_bid_never_strands_a_ride() {
    let harness = Harness::new();
    let rider = harness.seed(AccountBuilder::rider("Meera").build());
    let actor = Actor::Rider(rider.id);
    harness.store.set_commit_delay(Some(std::time::Duration::from_millis(50)));

    let (bid, deactivated) = tokio::join!(
        harness
            .engine
            .propose_bid(&actor, common::sample_bid(VehicleCategory::Mini, Some(250))),
        harness.engine.accounts().deactivate(&actor, rider.id),
    );

    assert_ne!(bid.is_ok(), deactivated.is_ok(), "{bid:?} {deactivated:?}");
    let stored = harness.account(&rider);
    if let Ok(ride) = bid {
        assert!(stored.active);
        assert_eq!(harness.store.ride(ride.id).unwrap().status(), RideStatus::Searching);
        assert_eq!(deactivated.unwrap_err().kind(), ErrorKind::Conflict);
    } else {
        assert!(!stored.active);
        assert_eq!(bid.unwrap_err().kind(), ErrorKind::Permission);
    }
}

#[tokio::test]
async fn ledgers_are_private_to_the_owner_and_administrators() {
    let harness = Harness::new();
    let rider = harness.seed(AccountBuilder::rider("Meera").build());
    let driver = harness.seed(AccountBuilder::driver("Ravi", VehicleCategory::Mini).build());
    let admin = harness.seed(AccountBuilder::admin("Ops").build());
    let ride = harness.post_ride(&rider, VehicleCategory::Mini, 250).await;
    harness.complete_trip(&ride, &driver).await;
    let accounts = harness.engine.accounts();

    let own = accounts.ledger(&Actor::Driver(driver.id), driver.id).await.unwrap();
    assert_eq!(own.len(), 1);
    let audited = accounts.ledger(&Actor::Admin(admin.id), driver.id).await.unwrap();
    assert_eq!(audited, own);

    let refused = accounts.ledger(&Actor::Rider(rider.id), driver.id).await.unwrap_err();
    assert_eq!(refused.kind(), ErrorKind::Permission);
}
