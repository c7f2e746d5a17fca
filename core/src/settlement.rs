//! Pure settlement math: driver payout on completion and rating folding.
//!
//! The runtime `SettlementEngine` reads the ride and the driver account,
//! calls these functions, and commits the results in one batch.

use crate::account::Account;
use crate::error::DispatchError;
use crate::ledger::WalletTransaction;
use crate::ride::{Rating, RideRequest, RideStatus};
use chrono::{DateTime, Utc};

/// Driver account after payout, plus the ledger entry recording it.
#[derive(Clone, Debug, PartialEq)]
pub struct TripCredit {
    /// Driver with wallet and trip count updated
    pub driver: Account,
    /// `TRIP_EARNING` entry for the ride
    pub entry: WalletTransaction,
}

/// Credit `ride.fare` to the assigned driver and count the trip.
///
/// # Errors
///
/// - [`DispatchError::InvalidTransition`] unless the ride is `COMPLETED`
/// - [`DispatchError::NotAssignedDriver`] if `driver` is not the ride's driver
/// - [`DispatchError::Conflict`] if the wallet or trip counter would overflow
pub fn credit_driver(
    driver: &Account,
    ride: &RideRequest,
    now: DateTime<Utc>,
) -> Result<TripCredit, DispatchError> {
    if ride.status() != RideStatus::Completed {
        return Err(DispatchError::InvalidTransition {
            ride_id: ride.id,
            status: ride.status(),
            command: "settle",
        });
    }
    if ride.driver_id() != Some(driver.id) {
        return Err(DispatchError::NotAssignedDriver {
            ride_id: ride.id,
            actor: driver.id,
        });
    }

    let amount = i64::from(ride.fare);
    let wallet_balance = driver
        .wallet_balance
        .checked_add(amount)
        .ok_or_else(|| DispatchError::conflict(format!("wallet of {} would overflow", driver.id)))?;
    let total_trips = driver
        .total_trips
        .checked_add(1)
        .ok_or_else(|| DispatchError::conflict(format!("trip count of {} would overflow", driver.id)))?;

    Ok(TripCredit {
        driver: Account {
            wallet_balance,
            total_trips,
            ..driver.clone()
        },
        entry: WalletTransaction::trip_earning(driver.id, ride.id, amount, now),
    })
}

/// Fold one rating into a running average, rounded to one decimal.
///
/// `prior_count` is the number of ratings already in `old_average`.
#[must_use]
pub fn fold_average(old_average: f64, prior_count: u32, rating: Rating) -> f64 {
    let prior = f64::from(prior_count);
    let average = (old_average * prior + f64::from(rating.stars())) / (prior + 1.0);
    (average * 10.0).round() / 10.0
}

/// Driver account with `rating` folded in.
#[must_use]
pub fn apply_rating(driver: &Account, rating: Rating) -> Account {
    Account {
        rating: fold_average(driver.rating, driver.rating_count, rating),
        rating_count: driver.rating_count.saturating_add(1),
        ..driver.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stars(value: u8) -> Rating {
        Rating::new(value).unwrap_or_else(|_| unreachable!("test ratings are in range"))
    }

    #[test]
    fn first_rating_becomes_the_average() {
        assert!((fold_average(0.0, 0, stars(4)) - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn average_is_rounded_to_one_decimal() {
        // (4.5 * 2 + 5) / 3 = 4.666..
        assert!((fold_average(4.5, 2, stars(5)) - 4.7).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn folded_average_stays_within_star_range(
            old in 1.0f64..=5.0,
            count in 0u32..10_000,
            value in 1u8..=5,
        ) {
            let average = fold_average(old, count, stars(value));
            prop_assert!((1.0..=5.0).contains(&average));
            prop_assert!(((average * 10.0).round() - average * 10.0).abs() < 1e-6);
        }

        #[test]
        fn folding_moves_the_average_toward_the_rating(
            old in 1.0f64..=5.0,
            count in 1u32..1_000,
            value in 1u8..=5,
        ) {
            let average = fold_average(old, count, stars(value));
            let lower = old.min(f64::from(value)) - 0.05;
            let upper = old.max(f64::from(value)) + 0.05;
            prop_assert!(average >= lower && average <= upper);
        }
    }
}
