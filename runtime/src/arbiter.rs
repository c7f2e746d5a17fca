//! Acceptance arbitration: exactly one driver wins a `SEARCHING` request.
//!
//! The arbiter reads the ride, lets the state machine build the accepted
//! ride, and commits it with the revision it read. Of N drivers racing, the
//! first commit lands; every other commit hits a revision conflict, re-reads,
//! finds the ride no longer `SEARCHING` and reports [`AcceptOutcome::Lost`].
//! Losing is an ordinary outcome, not an error.
//!
//! The driver's account is rewritten at its read revision in the same batch,
//! so one driver accepting two requests at once commits at most one of them;
//! the other re-reads and finds the driver busy.

use crate::commit::{AttemptError, load_account, load_ride, retry_on_conflict};
use crate::environment::DispatchEnvironment;
use crate::metrics::DispatchMetrics;
use crate::retry::RetryPolicy;
use ride_dispatch_core::DispatchError;
use ride_dispatch_core::account::Account;
use ride_dispatch_core::environment::Clock;
use ride_dispatch_core::machine::{RideCommand, RideStateMachine};
use ride_dispatch_core::notify::Notice;
use ride_dispatch_core::ride::{RideRequest, RideStatus};
use ride_dispatch_core::store::{RideQuery, RideStore, Versioned, WriteBatch};
use ride_dispatch_core::types::{AccountId, Actor, RideId};

/// Result of an accept attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum AcceptOutcome {
    /// This driver now holds the ride
    Won(RideRequest),
    /// The ride had already left `SEARCHING`
    Lost {
        /// Status found instead
        status: RideStatus,
        /// Driver who holds it, if any
        winner: Option<AccountId>,
    },
}

impl AcceptOutcome {
    /// Whether the attempt won.
    #[must_use]
    pub const fn is_won(&self) -> bool {
        matches!(self, Self::Won(_))
    }

    /// Accepted ride, when won.
    #[must_use]
    pub fn into_ride(self) -> Option<RideRequest> {
        match self {
            Self::Won(ride) => Some(ride),
            Self::Lost { .. } => None,
        }
    }
}

/// Resolves concurrent accepts through the store's revision check.
#[derive(Clone, Debug)]
pub struct AcceptanceArbiter {
    env: DispatchEnvironment,
    machine: RideStateMachine,
    retry: RetryPolicy,
}

impl AcceptanceArbiter {
    /// Create an arbiter; `retry` bounds re-reads after conflicts.
    #[must_use]
    pub const fn new(env: DispatchEnvironment, retry: RetryPolicy) -> Self {
        Self {
            env,
            machine: RideStateMachine::new(),
            retry,
        }
    }

    /// Try to assign `ride_id` to `driver_id`.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::RideNotFound`] / [`DispatchError::AccountNotFound`]
    /// - Permission errors when the driver is not approved, KYC verified,
    ///   active and online, cannot serve the ride's category, the request is
    ///   targeted at someone else, or it is the driver's own request
    /// - [`DispatchError::Conflict`] when the driver already has an active trip
    /// - [`DispatchError::Unavailable`] when the store cannot be reached
    #[tracing::instrument(skip_all, fields(ride_id = %ride_id, driver_id = %driver_id))]
    pub async fn accept(&self, ride_id: RideId, driver_id: AccountId) -> Result<AcceptOutcome, DispatchError> {
        let result = retry_on_conflict(&self.retry, || self.attempt(ride_id, driver_id)).await;

        match result {
            Ok((AcceptOutcome::Won(ride), notices)) => {
                DispatchMetrics::record_accept("won");
                DispatchMetrics::record_transition(RideStatus::Accepted);
                tracing::info!(status = %ride.status(), "Driver won the request");
                self.env.notify_all(notices);
                Ok(AcceptOutcome::Won(ride))
            },
            Ok((lost, _)) => {
                DispatchMetrics::record_accept("lost");
                tracing::debug!(outcome = ?lost, "Driver lost the request");
                Ok(lost)
            },
            Err(error) => {
                DispatchMetrics::record_accept("rejected");
                tracing::debug!(%error, "Accept rejected");
                Err(error)
            },
        }
    }

    async fn attempt(
        &self,
        ride_id: RideId,
        driver_id: AccountId,
    ) -> Result<(AcceptOutcome, Vec<Notice>), AttemptError> {
        let store = self.env.store.as_ref();
        let Versioned {
            revision: driver_revision,
            value: driver,
        } = load_account(store, driver_id).await?;
        ensure_available(&driver)?;

        let ride = load_ride(store, ride_id).await?;
        driver.ensure_can_serve(ride.value.category)?;
        if !ride.value.is_open_to(driver_id) {
            return Err(DispatchError::permission(format!(
                "ride {ride_id} was offered to another driver"
            ))
            .into());
        }

        if ride.value.status() != RideStatus::Searching {
            let lost = AcceptOutcome::Lost {
                status: ride.value.status(),
                winner: ride.value.driver_id(),
            };
            return Ok((lost, Vec::new()));
        }

        let busy = store.query_rides(RideQuery::active_for(driver_id)).await?;
        if let Some(current) = busy.first() {
            return Err(DispatchError::conflict(format!(
                "driver {driver_id} is already on ride {}",
                current.value.id
            ))
            .into());
        }

        let transition = self.machine.apply(
            &ride.value,
            &Actor::Driver(driver_id),
            RideCommand::Accept,
            self.env.clock.now(),
        )?;
        store
            .commit(
                WriteBatch::new()
                    .put_ride(transition.ride.clone(), ride.revision)
                    .put_account(driver, driver_revision),
            )
            .await?;

        Ok((
            AcceptOutcome::Won(transition.ride),
            transition.notices.into_vec(),
        ))
    }
}

/// Driver-side eligibility that does not depend on the ride.
fn ensure_available(driver: &Account) -> Result<(), DispatchError> {
    driver.ensure_can_drive()?;
    if !driver.online {
        return Err(DispatchError::permission(format!(
            "driver {} is offline",
            driver.id
        )));
    }
    Ok(())
}
