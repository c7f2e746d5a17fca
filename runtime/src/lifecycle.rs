//! Commits state machine transitions.
//!
//! Each command is applied to a fresh read of the ride and committed with
//! that read's revision. A transition into `COMPLETED` is handed to the
//! [`SettlementEngine`] so the ride, the driver payout and the ledger entry
//! land in the same commit.

use crate::accounts::verify_actor;
use crate::commit::{AttemptError, load_ride, retry_on_conflict};
use crate::environment::DispatchEnvironment;
use crate::metrics::{DispatchMetrics, SettlementMetrics};
use crate::retry::RetryPolicy;
use crate::settlement::SettlementEngine;
use ride_dispatch_core::DispatchError;
use ride_dispatch_core::environment::Clock;
use ride_dispatch_core::machine::{RideCommand, RideStateMachine};
use ride_dispatch_core::notify::Notice;
use ride_dispatch_core::ride::RideRequest;
use ride_dispatch_core::store::RideStore;
use ride_dispatch_core::types::{Actor, RideId};

/// Applies ride commands other than accept.
#[derive(Clone, Debug)]
pub struct RideLifecycle {
    env: DispatchEnvironment,
    machine: RideStateMachine,
    settlement: SettlementEngine,
    retry: RetryPolicy,
}

impl RideLifecycle {
    /// Create a lifecycle committing through `env.store`.
    #[must_use]
    pub const fn new(env: DispatchEnvironment, settlement: SettlementEngine, retry: RetryPolicy) -> Self {
        Self {
            env,
            machine: RideStateMachine::new(),
            settlement,
            retry,
        }
    }

    /// Apply `command` from `actor` to the ride and commit the result.
    ///
    /// # Errors
    ///
    /// Guard violations from the state machine (the ride is left as it
    /// was), [`DispatchError::RideNotFound`], role errors for an actor whose
    /// account lacks the claimed role, and [`DispatchError::Unavailable`]
    /// when the store cannot be reached.
    #[tracing::instrument(skip_all, fields(ride_id = %ride_id, actor = %actor, command = command.name()))]
    pub async fn advance(
        &self,
        ride_id: RideId,
        actor: &Actor,
        command: RideCommand,
    ) -> Result<RideRequest, DispatchError> {
        let completes = matches!(command, RideCommand::EndTrip | RideCommand::ConfirmPayment);
        let result = retry_on_conflict(&self.retry, || self.attempt(ride_id, actor, command.clone())).await;

        match result {
            Ok((ride, notices)) => {
                DispatchMetrics::record_transition(ride.status());
                tracing::info!(status = %ride.status(), "Ride advanced");
                self.env.notify_all(notices);
                Ok(ride)
            },
            Err(error) => {
                if completes && error.is_transient() {
                    SettlementMetrics::record_abort("completion");
                    tracing::error!(%error, "Completion aborted, nothing written");
                } else {
                    tracing::debug!(%error, "Command rejected");
                }
                Err(error)
            },
        }
    }

    async fn attempt(
        &self,
        ride_id: RideId,
        actor: &Actor,
        command: RideCommand,
    ) -> Result<(RideRequest, Vec<Notice>), AttemptError> {
        let store = self.env.store.as_ref();
        verify_actor(store, actor).await?;

        let ride = load_ride(store, ride_id).await?;
        let transition = self
            .machine
            .apply(&ride.value, actor, command, self.env.clock.now())?;

        if transition.settlement_due {
            self.settlement
                .commit_completion(&transition.ride, ride.revision)
                .await?;
        } else {
            store
                .compare_and_set_ride(transition.ride.clone(), ride.revision)
                .await?;
        }

        Ok((transition.ride, transition.notices.into_vec()))
    }
}
