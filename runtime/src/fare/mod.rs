//! Fare estimation and rider bids.
//!
//! Estimates come from the configured [`FareEstimator`], called with a
//! timeout behind a circuit breaker. Whatever it cannot answer (timeout,
//! error, open circuit, missing categories) is filled from the configured
//! fallback table, so creating a request never blocks on the estimator.
//!
//! A bid creates a `SEARCHING` request at the rider's amount. There are no
//! counter-offers; drivers either accept the amount or ignore the request.

mod distance;
mod http;

pub use distance::DistanceFareEstimator;
pub use http::HttpFareEstimator;

use crate::accounts::verify_actor;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::commit::{AttemptError, load_account, retry_on_conflict};
use crate::config::FareConfig;
use crate::environment::DispatchEnvironment;
use crate::metrics::{DispatchMetrics, FareMetrics};
use crate::retry::RetryPolicy;
use ride_dispatch_core::DispatchError;
use ride_dispatch_core::environment::{Clock, CodeGenerator};
use ride_dispatch_core::fare::{EstimatorError, FareEstimate, FareEstimator, FareTable};
use ride_dispatch_core::notify::Notice;
use ride_dispatch_core::ride::{RideDraft, RideRequest, RideStatus};
use ride_dispatch_core::store::{RideQuery, RideStore, WriteBatch};
use ride_dispatch_core::types::{
    AccountId, Actor, GeoPoint, Location, PaymentMethod, RidePreferences, VehicleCategory,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Where a quote's numbers came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuoteSource {
    /// Every category from the estimator
    Live,
    /// Some categories filled from the fallback table
    Partial,
    /// Entirely from the fallback table
    Fallback,
}

/// Estimates for every category.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FareQuote {
    /// Per-category estimates; never missing a category
    pub table: FareTable,
    /// Provenance
    pub source: QuoteSource,
}

impl FareQuote {
    /// Estimate for `category`.
    #[must_use]
    pub fn get(&self, category: VehicleCategory) -> Option<FareEstimate> {
        self.table.get(category)
    }
}

/// A rider's bid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidRequest {
    /// Pickup point
    pub pickup: Location,
    /// Drop point
    pub drop: Location,
    /// Requested tier
    pub category: VehicleCategory,
    /// Offered fare; `None` takes the estimate
    #[serde(default)]
    pub amount: Option<i64>,
    /// Payment method
    pub payment_method: PaymentMethod,
    /// Comfort preferences
    #[serde(default)]
    pub preferences: RidePreferences,
    /// Offer the request to this driver only
    #[serde(default)]
    pub target_driver_id: Option<AccountId>,
}

impl BidRequest {
    /// A broadcast cash bid at `amount`.
    #[must_use]
    pub const fn new(pickup: Location, drop: Location, category: VehicleCategory, amount: Option<i64>) -> Self {
        Self {
            pickup,
            drop,
            category,
            amount,
            payment_method: PaymentMethod::Cash,
            preferences: RidePreferences {
                silent: false,
                ac: false,
                music: false,
            },
            target_driver_id: None,
        }
    }

    /// Pay with `method`.
    #[must_use]
    pub const fn paid_with(mut self, method: PaymentMethod) -> Self {
        self.payment_method = method;
        self
    }

    /// Offer to `driver` only.
    #[must_use]
    pub const fn targeted_at(mut self, driver: AccountId) -> Self {
        self.target_driver_id = Some(driver);
        self
    }

    /// With comfort preferences.
    #[must_use]
    pub const fn with_preferences(mut self, preferences: RidePreferences) -> Self {
        self.preferences = preferences;
        self
    }
}

#[derive(Debug)]
enum EstimateFailure {
    Timeout,
    Estimator(EstimatorError),
}

impl std::fmt::Display for EstimateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("estimator timed out"),
            Self::Estimator(error) => write!(f, "{error}"),
        }
    }
}

/// Baseline estimates and bid creation.
#[derive(Clone)]
pub struct FareNegotiationEngine {
    env: DispatchEnvironment,
    config: FareConfig,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl FareNegotiationEngine {
    /// Create an engine using `env.estimator`.
    #[must_use]
    pub fn new(env: DispatchEnvironment, config: FareConfig, retry: RetryPolicy) -> Self {
        let breaker = CircuitBreaker::new("fare_estimator", config.breaker());
        Self {
            env,
            config,
            breaker,
            retry,
        }
    }

    /// The estimator's circuit breaker.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Per-category estimates between two points.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Validation`] for out-of-range coordinates. Estimator
    /// failures are not errors; they produce a fallback quote.
    #[tracing::instrument(skip_all, fields(pickup = %pickup, drop = %drop))]
    pub async fn estimate(&self, pickup: GeoPoint, drop: GeoPoint) -> Result<FareQuote, DispatchError> {
        validate_points(pickup, drop)?;

        let timeout = self.config.estimator_timeout();
        let estimator = &self.env.estimator;
        let started = Instant::now();
        let result = self
            .breaker
            .call(|| async move {
                match tokio::time::timeout(timeout, estimator.estimate(pickup, drop)).await {
                    Ok(Ok(table)) => Ok(table),
                    Ok(Err(error)) => Err(EstimateFailure::Estimator(error)),
                    Err(_) => Err(EstimateFailure::Timeout),
                }
            })
            .await;

        let (reason, error) = match result {
            Ok(table) => {
                FareMetrics::record_estimate(started.elapsed());
                return Ok(self.complete(table));
            },
            Err(CircuitBreakerError::Open) => ("circuit_open", "circuit open".to_string()),
            Err(CircuitBreakerError::Inner(EstimateFailure::Timeout)) => {
                ("timeout", EstimateFailure::Timeout.to_string())
            },
            Err(CircuitBreakerError::Inner(failure)) => ("error", failure.to_string()),
        };

        FareMetrics::record_fallback(reason);
        tracing::warn!(reason, %error, "Fare estimator unavailable, using fallback table");
        Ok(FareQuote {
            table: self.config.fallback_table(),
            source: QuoteSource::Fallback,
        })
    }

    fn complete(&self, mut table: FareTable) -> FareQuote {
        let missing: Vec<VehicleCategory> = table.missing().collect();
        if missing.is_empty() {
            return FareQuote {
                table,
                source: QuoteSource::Live,
            };
        }

        FareMetrics::record_fallback("incomplete");
        tracing::warn!(?missing, "Estimator omitted categories, filling from fallback table");
        let source = if missing.len() == VehicleCategory::ALL.len() {
            QuoteSource::Fallback
        } else {
            QuoteSource::Partial
        };
        for category in missing {
            table.insert(category, self.config.fallback(category));
        }
        FareQuote { table, source }
    }

    /// Create a `SEARCHING` request at the rider's amount.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Validation`] for a non-positive or oversized amount,
    ///   invalid or identical pickup and drop points
    /// - Permission errors unless `actor` is an active rider; a target driver
    ///   must be an approved, online driver who can serve the category and is
    ///   not the rider
    /// - [`DispatchError::Conflict`] while the rider has another unfinished
    ///   request
    #[tracing::instrument(skip_all, fields(actor = %actor, category = %bid.category))]
    pub async fn propose_bid(&self, actor: &Actor, bid: BidRequest) -> Result<RideRequest, DispatchError> {
        let Actor::Rider(rider_id) = *actor else {
            return Err(DispatchError::permission(format!("{actor} cannot place bids")));
        };
        validate_points(bid.pickup.point, bid.drop.point)?;
        validate_address("pickup", &bid.pickup)?;
        validate_address("drop", &bid.drop)?;
        if bid.pickup.point == bid.drop.point {
            return Err(DispatchError::validation("pickup and drop must differ"));
        }

        let fare = match bid.amount {
            Some(amount) => validate_amount(amount)?,
            None => {
                let quote = self.estimate(bid.pickup.point, bid.drop.point).await?;
                quote
                    .get(bid.category)
                    .unwrap_or_else(|| self.config.fallback(bid.category))
                    .amount
            },
        };

        let draft = RideDraft {
            rider_id,
            pickup: bid.pickup,
            drop: bid.drop,
            category: bid.category,
            fare,
            payment_method: bid.payment_method,
            preferences: bid.preferences,
            target_driver_id: bid.target_driver_id,
        };

        let ride = retry_on_conflict(&self.retry, || self.create(actor, draft.clone())).await?;

        DispatchMetrics::record_transition(RideStatus::Searching);
        tracing::info!(ride_id = %ride.id, fare = ride.fare, targeted = ride.target_driver_id.is_some(), "Bid posted");
        if let Some(driver_id) = ride.target_driver_id {
            self.env.notify_all([Notice::BidPosted {
                ride_id: ride.id,
                driver_id,
                fare: ride.fare,
            }]);
        }
        Ok(ride)
    }

    async fn create(&self, actor: &Actor, draft: RideDraft) -> Result<RideRequest, AttemptError> {
        let store = self.env.store.as_ref();
        verify_actor(store, actor).await?;
        let rider = load_account(store, draft.rider_id).await?;

        let open = store.query_rides(RideQuery::open_for(draft.rider_id)).await?;
        if let Some(existing) = open.iter().find(|ride| ride.value.rider_id == draft.rider_id) {
            return Err(DispatchError::conflict(format!(
                "rider {} already has request {} in progress",
                draft.rider_id, existing.value.id
            ))
            .into());
        }

        if let Some(target) = draft.target_driver_id {
            if target == draft.rider_id {
                return Err(DispatchError::validation("a bid cannot target the rider").into());
            }
            let driver = load_account(store, target).await?.value;
            driver.ensure_can_drive()?;
            driver.ensure_can_serve(draft.category)?;
            if !driver.online {
                return Err(DispatchError::permission(format!("driver {target} is offline")).into());
            }
        }

        let ride = RideRequest::searching(draft, self.env.codes.next_code(), self.env.clock.now());

        // Rewriting the rider at its read revision serializes concurrent bids.
        store
            .commit(
                WriteBatch::new()
                    .insert_ride(ride.clone())
                    .put_account(rider.value, rider.revision),
            )
            .await?;
        Ok(ride)
    }
}

impl std::fmt::Debug for FareNegotiationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FareNegotiationEngine")
            .field("breaker", &self.breaker.name())
            .finish_non_exhaustive()
    }
}

fn validate_points(pickup: GeoPoint, drop: GeoPoint) -> Result<(), DispatchError> {
    for (name, point) in [("pickup", pickup), ("drop", drop)] {
        if !point.is_valid() {
            return Err(DispatchError::validation(format!("invalid {name} coordinates {point}")));
        }
    }
    Ok(())
}

fn validate_address(name: &str, location: &Location) -> Result<(), DispatchError> {
    if location.address.chars().count() > Location::MAX_ADDRESS_LEN {
        return Err(DispatchError::validation(format!(
            "{name} address is longer than {} characters",
            Location::MAX_ADDRESS_LEN
        )));
    }
    Ok(())
}

fn validate_amount(amount: i64) -> Result<u32, DispatchError> {
    if amount <= 0 {
        return Err(DispatchError::validation(format!(
            "bid amount must be a positive integer, got {amount}"
        )));
    }
    u32::try_from(amount)
        .map_err(|_| DispatchError::validation(format!("bid amount {amount} is too large")))
}
