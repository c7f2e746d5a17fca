//! Atomic settlement: driver payout on completion, rating aggregation later.
//!
//! Both paths commit one [`WriteBatch`] holding the ride and the driver
//! account at the revisions they were read at. Completion also appends the
//! `TRIP_EARNING` ledger entry. The store applies the whole batch or nothing,
//! so a completed ride without its payout cannot exist.

use crate::accounts::verify_actor;
use crate::commit::{AttemptError, load_account, load_ride, retry_on_conflict};
use crate::environment::DispatchEnvironment;
use crate::metrics::SettlementMetrics;
use crate::retry::RetryPolicy;
use ride_dispatch_core::DispatchError;
use ride_dispatch_core::environment::Clock;
use ride_dispatch_core::machine::RideStateMachine;
use ride_dispatch_core::ride::{Rating, RideRequest};
use ride_dispatch_core::settlement::{apply_rating, credit_driver};
use ride_dispatch_core::store::{CommitReceipt, Revision, RideStore, WriteBatch};
use ride_dispatch_core::types::{AccountId, Actor, RideId};
use serde::Serialize;

/// Driver's aggregate after a rating landed.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingReceipt {
    /// Rated ride
    pub ride_id: RideId,
    /// Rated driver
    pub driver_id: AccountId,
    /// Stars given
    pub stars: u8,
    /// Driver's new average
    pub driver_rating: f64,
    /// Ratings folded into the average
    pub rating_count: u32,
}

/// Writes payouts and ratings atomically.
#[derive(Clone, Debug)]
pub struct SettlementEngine {
    env: DispatchEnvironment,
    machine: RideStateMachine,
    retry: RetryPolicy,
}

impl SettlementEngine {
    /// Create an engine; `retry` bounds read-compute-commit attempts.
    #[must_use]
    pub const fn new(env: DispatchEnvironment, retry: RetryPolicy) -> Self {
        Self {
            env,
            machine: RideStateMachine::new(),
            retry,
        }
    }

    /// Commit a freshly `COMPLETED` ride together with the driver payout.
    ///
    /// `ride_revision` is the revision the ride was read at before the
    /// transition; a conflict on it (or on the driver account) is returned
    /// to the caller, which re-runs the transition from fresh reads.
    pub(crate) async fn commit_completion(
        &self,
        completed: &RideRequest,
        ride_revision: Revision,
    ) -> Result<CommitReceipt, AttemptError> {
        let store = self.env.store.as_ref();
        let driver_id = completed
            .driver_id()
            .ok_or_else(|| DispatchError::conflict(format!("ride {} has no driver", completed.id)))?;
        let driver = load_account(store, driver_id).await?;
        let credit = credit_driver(&driver.value, completed, self.env.clock.now())?;

        let batch = WriteBatch::new()
            .put_ride(completed.clone(), ride_revision)
            .put_account(credit.driver, driver.revision)
            .append_ledger(credit.entry);

        let receipt = store.commit(batch).await?;
        SettlementMetrics::record_settlement("completion");
        tracing::info!(
            ride_id = %completed.id,
            driver_id = %driver_id,
            amount = completed.fare,
            "Trip settled"
        );
        Ok(receipt)
    }

    /// Record the rider's rating on the ride and fold it into the driver's
    /// average in one commit.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::InvalidTransition`] unless the ride is `COMPLETED`
    /// - [`DispatchError::NotRider`] unless `actor` is the ride's rider
    /// - [`DispatchError::Conflict`] if the ride was already rated, or
    ///   conflicting writes outlasted every retry
    /// - [`DispatchError::Unavailable`] when nothing could be written
    #[tracing::instrument(skip_all, fields(ride_id = %ride_id, stars = rating.stars()))]
    pub async fn rate_driver(
        &self,
        ride_id: RideId,
        actor: &Actor,
        rating: Rating,
    ) -> Result<RatingReceipt, DispatchError> {
        let result = retry_on_conflict(&self.retry, || self.rate_attempt(ride_id, actor, rating)).await;

        match &result {
            Ok(receipt) => {
                SettlementMetrics::record_settlement("rating");
                tracing::info!(
                    driver_id = %receipt.driver_id,
                    driver_rating = receipt.driver_rating,
                    rating_count = receipt.rating_count,
                    "Rating folded into driver average"
                );
            },
            Err(error) if error.is_transient() => {
                SettlementMetrics::record_abort("rating");
                tracing::error!(%error, "Rating aborted, nothing written");
            },
            Err(error) => tracing::debug!(%error, "Rating rejected"),
        }
        result
    }

    async fn rate_attempt(
        &self,
        ride_id: RideId,
        actor: &Actor,
        rating: Rating,
    ) -> Result<RatingReceipt, AttemptError> {
        let store = self.env.store.as_ref();
        verify_actor(store, actor).await?;
        let ride = load_ride(store, ride_id).await?;
        let rated = self.machine.rate(&ride.value, actor, rating)?;
        let driver_id = rated
            .driver_id()
            .ok_or_else(|| DispatchError::conflict(format!("ride {ride_id} has no driver")))?;

        let driver = load_account(store, driver_id).await?;
        let updated = apply_rating(&driver.value, rating);
        let receipt = RatingReceipt {
            ride_id,
            driver_id,
            stars: rating.stars(),
            driver_rating: updated.rating,
            rating_count: updated.rating_count,
        };

        store
            .commit(
                WriteBatch::new()
                    .put_ride(rated, ride.revision)
                    .put_account(updated, driver.revision),
            )
            .await?;
        Ok(receipt)
    }
}
