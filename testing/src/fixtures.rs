//! Builders and sample data for tests.

use crate::mocks::test_clock;
use ride_dispatch_core::account::Account;
use ride_dispatch_core::environment::Clock;
use ride_dispatch_core::ride::{RideDraft, RideRequest, TripCode};
use ride_dispatch_core::types::{
    AccountId, Gender, GeoPoint, Location, PaymentMethod, RidePreferences, Role, VehicleCategory,
};

/// Trip code carried by [`sample_ride`].
pub const SAMPLE_CODE: &str = "482913";

/// Pickup used across tests (Mathura, near the station).
#[must_use]
pub const fn pickup_point() -> GeoPoint {
    GeoPoint::new(27.49, 77.67)
}

/// Drop used across tests, about 1.5 km from [`pickup_point`].
#[must_use]
pub const fn drop_point() -> GeoPoint {
    GeoPoint::new(27.50, 77.68)
}

/// A cash ride draft between the sample points.
#[must_use]
pub fn sample_draft(rider_id: AccountId, category: VehicleCategory, fare: u32) -> RideDraft {
    RideDraft {
        rider_id,
        pickup: Location::new(pickup_point(), "Mathura Junction"),
        drop: Location::new(drop_point(), "Krishna Janmabhoomi"),
        category,
        fare,
        payment_method: PaymentMethod::Cash,
        preferences: RidePreferences::default(),
        target_driver_id: None,
    }
}

/// A `SEARCHING` ride built from [`sample_draft`] with [`SAMPLE_CODE`].
#[must_use]
#[allow(clippy::expect_used)]
pub fn sample_ride(rider_id: AccountId, category: VehicleCategory, fare: u32) -> RideRequest {
    RideRequest::searching(
        sample_draft(rider_id, category, fare),
        SAMPLE_CODE
            .parse::<TripCode>()
            .expect("sample code is six digits"),
        test_clock().now(),
    )
}

/// Fluent builder for accounts.
///
/// # Example
///
/// ```
/// use ride_dispatch_testing::fixtures::AccountBuilder;
/// use ride_dispatch_core::types::VehicleCategory;
///
/// let driver = AccountBuilder::driver("Lakshmi", VehicleCategory::Pink)
///     .female()
///     .build();
/// assert!(driver.online);
/// assert!(driver.can_serve(VehicleCategory::Pink));
/// ```
#[derive(Clone, Debug)]
pub struct AccountBuilder {
    account: Account,
}

impl AccountBuilder {
    fn base(name: &str, roles: &[Role]) -> Self {
        Self {
            account: Account::new(
                AccountId::new(),
                name,
                roles.iter().copied(),
                test_clock().now(),
            ),
        }
    }

    /// An active rider.
    #[must_use]
    pub fn rider(name: &str) -> Self {
        Self::base(name, &[Role::Rider])
    }

    /// An approved, KYC-verified, online male driver at the sample pickup.
    #[must_use]
    pub fn driver(name: &str, category: VehicleCategory) -> Self {
        let mut builder = Self::base(name, &[Role::Driver]);
        builder.account.approved = true;
        builder.account.kyc_verified = true;
        builder.account.online = true;
        builder.account.vehicle_category = Some(category);
        builder.account.gender = Some(Gender::Male);
        builder.account.last_location = Some(pickup_point());
        builder
    }

    /// An administrator.
    #[must_use]
    pub fn admin(name: &str) -> Self {
        Self::base(name, &[Role::Admin])
    }

    /// Add the rider role as well.
    #[must_use]
    pub fn also_rider(mut self) -> Self {
        self.account.roles.insert(Role::Rider);
        self
    }

    /// Female account.
    #[must_use]
    pub fn female(mut self) -> Self {
        self.account.gender = Some(Gender::Female);
        self
    }

    /// Not yet approved by an administrator.
    #[must_use]
    pub fn unapproved(mut self) -> Self {
        self.account.approved = false;
        self
    }

    /// KYC not verified.
    #[must_use]
    pub fn without_kyc(mut self) -> Self {
        self.account.kyc_verified = false;
        self
    }

    /// Offline driver.
    #[must_use]
    pub fn offline(mut self) -> Self {
        self.account.online = false;
        self
    }

    /// Deactivated account.
    #[must_use]
    pub fn deactivated(mut self) -> Self {
        self.account.active = false;
        self
    }

    /// Last known location.
    #[must_use]
    pub fn at(mut self, point: GeoPoint) -> Self {
        self.account.last_location = Some(point);
        self
    }

    /// Unknown location.
    #[must_use]
    pub fn nowhere(mut self) -> Self {
        self.account.last_location = None;
        self
    }

    /// Existing rating history.
    #[must_use]
    pub fn rated(mut self, average: f64, count: u32) -> Self {
        self.account.rating = average;
        self.account.rating_count = count;
        self
    }

    /// Starting wallet balance.
    #[must_use]
    pub fn with_wallet(mut self, balance: i64) -> Self {
        self.account.wallet_balance = balance;
        self
    }

    /// Finish
    #[must_use]
    pub fn build(self) -> Account {
        self.account
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_points_are_about_a_kilometre_and_a_half_apart() {
        let distance = pickup_point().distance_km(&drop_point());
        assert!(distance > 1.0 && distance < 2.0);
    }

    #[test]
    fn default_driver_is_eligible() {
        let driver = AccountBuilder::driver("Dev", VehicleCategory::Sedan).build();
        assert!(driver.ensure_can_drive().is_ok());
        assert!(driver.can_serve(VehicleCategory::Sedan));
    }
}
