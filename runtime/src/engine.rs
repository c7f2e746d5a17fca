//! The dispatch engine facade.
//!
//! [`DispatchEngine`] wires the arbiter, lifecycle, settlement, fare engine,
//! broadcaster and account directory onto one [`DispatchEnvironment`]. Every
//! operation runs under the configured timeout and is timed into
//! `dispatch_operation_duration_seconds`.
//!
//! # Example
//!
//! ```no_run
//! use ride_dispatch_runtime::engine::DispatchEngine;
//! use ride_dispatch_runtime::config::DispatchConfig;
//! # use std::sync::Arc;
//! # async fn example(store: Arc<dyn ride_dispatch_core::store::RideStore>) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = DispatchEngine::builder()
//!     .config(DispatchConfig::from_env())
//!     .store(store)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use crate::accounts::{AccountDirectory, verify_actor};
use crate::arbiter::{AcceptOutcome, AcceptanceArbiter};
use crate::broadcaster::DispatchBroadcaster;
use crate::codes::RandomCodeGenerator;
use crate::commit::load_ride;
use crate::config::{ConfigError, DispatchConfig};
use crate::environment::DispatchEnvironment;
use crate::fare::{BidRequest, DistanceFareEstimator, FareNegotiationEngine, FareQuote, HttpFareEstimator};
use crate::lifecycle::RideLifecycle;
use crate::metrics::DispatchMetrics;
use crate::notify::LogNotifier;
use crate::session::Session;
use crate::settlement::{RatingReceipt, SettlementEngine};
use ride_dispatch_core::DispatchError;
use ride_dispatch_core::environment::{Clock, CodeGenerator, SystemClock};
use ride_dispatch_core::fare::FareEstimator;
use ride_dispatch_core::machine::RideCommand;
use ride_dispatch_core::notify::{Notice, Notifier};
use ride_dispatch_core::ride::{Rating, RideRequest};
use ride_dispatch_core::store::RideStore;
use ride_dispatch_core::types::{Actor, GeoPoint, RideId};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Reason a cancellation by the system actor records for unanswered
/// requests.
pub const EXPIRED_REASON: &str = "no driver accepted the request";

/// Errors building an engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// No store was supplied
    #[error("A ride store is required")]
    MissingStore,

    /// Configuration failed validation
    #[error(transparent)]
    Config(#[from] ConfigError),
}

struct EngineInner {
    config: DispatchConfig,
    env: DispatchEnvironment,
    accounts: AccountDirectory,
    fares: FareNegotiationEngine,
    arbiter: AcceptanceArbiter,
    lifecycle: RideLifecycle,
    settlement: SettlementEngine,
    broadcaster: DispatchBroadcaster,
}

/// Entry point for every dispatch operation. Cheap to clone.
#[derive(Clone)]
pub struct DispatchEngine {
    inner: Arc<EngineInner>,
}

impl DispatchEngine {
    /// Start building an engine.
    #[must_use]
    pub fn builder() -> DispatchEngineBuilder {
        DispatchEngineBuilder::default()
    }

    /// Configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    /// Collaborators the engine was built with.
    #[must_use]
    pub fn environment(&self) -> &DispatchEnvironment {
        &self.inner.env
    }

    /// Account registration, availability and administration.
    #[must_use]
    pub fn accounts(&self) -> &AccountDirectory {
        &self.inner.accounts
    }

    /// Fare engine, including the estimator's circuit breaker.
    #[must_use]
    pub fn fares(&self) -> &FareNegotiationEngine {
        &self.inner.fares
    }

    /// Live views without a session.
    #[must_use]
    pub fn broadcaster(&self) -> &DispatchBroadcaster {
        &self.inner.broadcaster
    }

    /// Per-category estimates between two points; never fails because the
    /// estimator is down.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Validation`] for invalid coordinates,
    /// [`DispatchError::Timeout`] past the operation deadline.
    pub async fn estimate(&self, pickup: GeoPoint, drop: GeoPoint) -> Result<FareQuote, DispatchError> {
        self.run("estimate", self.inner.fares.estimate(pickup, drop))
            .await
    }

    /// Create a `SEARCHING` request at the rider's amount.
    ///
    /// # Errors
    ///
    /// See [`FareNegotiationEngine::propose_bid`].
    pub async fn propose_bid(&self, actor: &Actor, bid: BidRequest) -> Result<RideRequest, DispatchError> {
        self.run("propose_bid", self.inner.fares.propose_bid(actor, bid))
            .await
    }

    /// Race for a request. Losing is [`AcceptOutcome::Lost`], not an error.
    ///
    /// # Errors
    ///
    /// Permission errors unless `actor` is an eligible, online driver; see
    /// [`AcceptanceArbiter::accept`].
    pub async fn accept(&self, actor: &Actor, ride_id: RideId) -> Result<AcceptOutcome, DispatchError> {
        let Actor::Driver(driver_id) = *actor else {
            return Err(DispatchError::permission(format!("{actor} cannot accept rides")));
        };
        self.run("accept", self.inner.arbiter.accept(ride_id, driver_id))
            .await
    }

    /// Assigned driver reached the pickup.
    ///
    /// # Errors
    ///
    /// Guard violations leave the ride unchanged; see [`RideLifecycle::advance`].
    pub async fn mark_arrived(&self, actor: &Actor, ride_id: RideId) -> Result<RideRequest, DispatchError> {
        self.advance("mark_arrived", actor, ride_id, RideCommand::MarkArrived)
            .await
    }

    /// Start the trip with the code the rider read out.
    ///
    /// # Errors
    ///
    /// [`DispatchError::TripCodeMismatch`] for a wrong code; the ride stays
    /// `ARRIVED`.
    pub async fn start_trip(
        &self,
        actor: &Actor,
        ride_id: RideId,
        code: impl Into<String>,
    ) -> Result<RideRequest, DispatchError> {
        let command = RideCommand::StartTrip { code: code.into() };
        self.advance("start_trip", actor, ride_id, command).await
    }

    /// End the trip. Cash and wallet trips settle immediately; UPI and card
    /// trips wait in `PAYMENT_PENDING`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Conflict`] when the trip already ended;
    /// [`DispatchError::Unavailable`] aborts settlement without writing.
    pub async fn end_trip(&self, actor: &Actor, ride_id: RideId) -> Result<RideRequest, DispatchError> {
        self.advance("end_trip", actor, ride_id, RideCommand::EndTrip)
            .await
    }

    /// Payment captured; settle a `PAYMENT_PENDING` ride.
    ///
    /// # Errors
    ///
    /// Permission errors unless `actor` is the assigned driver or the system.
    pub async fn confirm_payment(&self, actor: &Actor, ride_id: RideId) -> Result<RideRequest, DispatchError> {
        self.advance("confirm_payment", actor, ride_id, RideCommand::ConfirmPayment)
            .await
    }

    /// Rider withdraws a request still `SEARCHING`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::InvalidTransition`] when a driver accepted first.
    pub async fn cancel_search(
        &self,
        actor: &Actor,
        ride_id: RideId,
        reason: Option<String>,
    ) -> Result<RideRequest, DispatchError> {
        self.advance("cancel_search", actor, ride_id, RideCommand::CancelSearch { reason })
            .await
    }

    /// Rider or assigned driver cancels an accepted ride.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Validation`] for an empty reason; conflicts once the
    /// trip has started.
    pub async fn cancel_trip(
        &self,
        actor: &Actor,
        ride_id: RideId,
        reason: impl Into<String>,
    ) -> Result<RideRequest, DispatchError> {
        let command = RideCommand::CancelTrip { reason: reason.into() };
        self.advance("cancel_trip", actor, ride_id, command).await
    }

    /// Cancel an unanswered request on behalf of the system.
    ///
    /// # Errors
    ///
    /// [`DispatchError::InvalidTransition`] once a driver has accepted.
    pub async fn expire_request(&self, ride_id: RideId) -> Result<RideRequest, DispatchError> {
        let command = RideCommand::CancelSearch {
            reason: Some(EXPIRED_REASON.to_string()),
        };
        self.advance("expire_request", &Actor::System, ride_id, command)
            .await
    }

    /// Rider rates the driver of a completed ride, 1 to 5 stars.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Validation`] for stars outside 1..=5; see
    /// [`SettlementEngine::rate_driver`].
    pub async fn rate_driver(
        &self,
        actor: &Actor,
        ride_id: RideId,
        stars: u8,
    ) -> Result<RatingReceipt, DispatchError> {
        let rating = Rating::new(stars).map_err(|error| DispatchError::validation(error.to_string()))?;
        self.run("rate_driver", self.inner.settlement.rate_driver(ride_id, actor, rating))
            .await
    }

    /// Forward an SOS for a ride `actor` takes part in. Administrators may
    /// raise one for any ride.
    ///
    /// # Errors
    ///
    /// Permission errors for anyone else; [`DispatchError::RideNotFound`].
    #[tracing::instrument(skip_all, fields(actor = %actor, ride_id = %ride_id))]
    pub async fn raise_sos(&self, actor: &Actor, ride_id: RideId) -> Result<(), DispatchError> {
        self.run("raise_sos", self.sos(actor, ride_id)).await
    }

    /// Current state of a ride.
    ///
    /// # Errors
    ///
    /// [`DispatchError::RideNotFound`] or [`DispatchError::Unavailable`].
    pub async fn ride(&self, ride_id: RideId) -> Result<RideRequest, DispatchError> {
        let store = self.inner.env.store.as_ref();
        let load = async move {
            let ride = load_ride(store, ride_id).await?;
            Ok::<_, DispatchError>(ride.value)
        };
        self.run("ride", load).await
    }

    /// Open a session holding `actor`'s live feeds.
    ///
    /// # Errors
    ///
    /// See [`Session`]; permission errors for the system actor or a
    /// deactivated account.
    pub async fn open_session(&self, actor: Actor) -> Result<Session, DispatchError> {
        let open = Session::open(
            Arc::clone(&self.inner.env.store),
            self.inner.broadcaster.clone(),
            self.inner.config.feed.pickup_radius_km,
            actor,
        );
        self.run("open_session", open).await
    }

    async fn advance(
        &self,
        operation: &'static str,
        actor: &Actor,
        ride_id: RideId,
        command: RideCommand,
    ) -> Result<RideRequest, DispatchError> {
        self.run(operation, self.inner.lifecycle.advance(ride_id, actor, command))
            .await
    }

    async fn sos(&self, actor: &Actor, ride_id: RideId) -> Result<(), DispatchError> {
        let store = self.inner.env.store.as_ref();
        let Some(raised_by) = actor.account_id() else {
            return Err(DispatchError::permission("the system actor cannot raise an SOS"));
        };
        verify_actor(store, actor).await?;

        let ride = load_ride(store, ride_id).await?.value;
        if !matches!(actor, Actor::Admin(_)) && !ride.involves(raised_by) {
            return Err(DispatchError::permission(format!(
                "{actor} is not part of ride {ride_id}"
            )));
        }

        let location = store
            .load_account(raised_by)
            .await?
            .and_then(|account| account.value.last_location);
        tracing::warn!(status = %ride.status(), ?location, "SOS raised");
        self.inner.env.notify_all([Notice::Sos {
            ride_id,
            raised_by,
            location,
        }]);
        Ok(())
    }

    async fn run<T, Fut>(&self, operation: &'static str, future: Fut) -> Result<T, DispatchError>
    where
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let started = Instant::now();
        let deadline = self.inner.config.engine.operation_timeout();

        let result = tokio::time::timeout(deadline, future)
            .await
            .unwrap_or_else(|_| {
                tracing::warn!(operation, "Operation timed out");
                Err(DispatchError::Timeout {
                    operation,
                    after_ms: self.inner.config.engine.operation_timeout_ms,
                })
            });

        DispatchMetrics::record_operation(operation, started.elapsed());
        result
    }
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`DispatchEngine`].
///
/// Only the store is required. Unset collaborators default to the distance
/// estimator (or the HTTP estimator when `FARE_ESTIMATOR_URL` is
/// configured), the logging notifier, the system clock and random trip codes.
#[derive(Default)]
pub struct DispatchEngineBuilder {
    config: Option<DispatchConfig>,
    store: Option<Arc<dyn RideStore>>,
    estimator: Option<Arc<dyn FareEstimator>>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Option<Arc<dyn Clock>>,
    codes: Option<Arc<dyn CodeGenerator>>,
}

impl DispatchEngineBuilder {
    /// Engine configuration. Default: [`DispatchConfig::default`]
    #[must_use]
    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Ride store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn RideStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Fare estimator.
    #[must_use]
    pub fn estimator(mut self, estimator: Arc<dyn FareEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Notification sink.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Time source.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Trip code source.
    #[must_use]
    pub fn codes(mut self, codes: Arc<dyn CodeGenerator>) -> Self {
        self.codes = Some(codes);
        self
    }

    /// Build the engine.
    ///
    /// # Errors
    ///
    /// [`BuildError::MissingStore`] without a store,
    /// [`BuildError::Config`] when the configuration is invalid.
    pub fn build(self) -> Result<DispatchEngine, BuildError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let store = self.store.ok_or(BuildError::MissingStore)?;

        let estimator = self.estimator.unwrap_or_else(|| match &config.fare.estimator_url {
            Some(url) => Arc::new(HttpFareEstimator::new(url.clone())),
            None => Arc::new(DistanceFareEstimator::new(config.fare.clone())),
        });

        let env = DispatchEnvironment {
            store: Arc::clone(&store),
            estimator,
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            codes: self.codes.unwrap_or_else(|| Arc::new(RandomCodeGenerator::new())),
        };

        let retry = config.engine.commit_retry();
        let settlement = SettlementEngine::new(env.clone(), retry.clone());

        Ok(DispatchEngine {
            inner: Arc::new(EngineInner {
                accounts: AccountDirectory::new(env.clone(), retry.clone()),
                fares: FareNegotiationEngine::new(env.clone(), config.fare.clone(), retry.clone()),
                arbiter: AcceptanceArbiter::new(env.clone(), retry.clone()),
                lifecycle: RideLifecycle::new(env.clone(), settlement.clone(), retry),
                settlement,
                broadcaster: DispatchBroadcaster::new(store, config.feed.reconnect()),
                env,
                config,
            }),
        })
    }
}

impl std::fmt::Debug for DispatchEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngineBuilder")
            .field("config", &self.config)
            .field("store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}
