//! Fare estimates and the estimator collaborator.

use crate::types::{GeoPoint, VehicleCategory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Estimated fare and pickup ETA for one category. Never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FareEstimate {
    /// Fare in whole currency units
    pub amount: u32,
    /// Minutes until a driver could reach the pickup
    pub eta_minutes: u32,
}

/// Estimates keyed by category.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FareTable(BTreeMap<VehicleCategory, FareEstimate>);

impl FareTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimate for `category`, if present.
    #[must_use]
    pub fn get(&self, category: VehicleCategory) -> Option<FareEstimate> {
        self.0.get(&category).copied()
    }

    /// Sets the estimate for `category`.
    pub fn insert(&mut self, category: VehicleCategory, estimate: FareEstimate) {
        self.0.insert(category, estimate);
    }

    /// Categories without an estimate.
    pub fn missing(&self) -> impl Iterator<Item = VehicleCategory> + '_ {
        VehicleCategory::ALL
            .into_iter()
            .filter(|category| !self.0.contains_key(category))
    }

    /// Estimates in category order.
    pub fn iter(&self) -> impl Iterator<Item = (VehicleCategory, FareEstimate)> + '_ {
        self.0.iter().map(|(category, estimate)| (*category, *estimate))
    }

    /// Number of categories with an estimate
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table has no estimates
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(VehicleCategory, FareEstimate)> for FareTable {
    fn from_iter<I: IntoIterator<Item = (VehicleCategory, FareEstimate)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Estimator failure; the engine falls back to configured defaults.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EstimatorError {
    /// Service unreachable or returned an error status.
    #[error("Fare estimator unavailable: {0}")]
    Unavailable(String),
    /// Response could not be interpreted.
    #[error("Invalid fare estimate: {0}")]
    InvalidResponse(String),
}

/// External fare/route estimation service.
pub trait FareEstimator: Send + Sync {
    /// Per-category estimates for a trip. Categories may be missing.
    ///
    /// # Errors
    ///
    /// Returns [`EstimatorError`] when the service cannot answer.
    fn estimate(
        &self,
        pickup: GeoPoint,
        drop: GeoPoint,
    ) -> Pin<Box<dyn Future<Output = Result<FareTable, EstimatorError>> + Send + '_>>;
}

/// Multipliers offered to riders as bid presets.
pub const BID_MULTIPLIERS: [f64; 4] = [0.9, 1.0, 1.1, 1.25];

/// A preset bid shown next to an estimate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedBid {
    /// Multiplier applied to the estimate
    pub multiplier: f64,
    /// Resulting amount, rounded to the nearest unit and at least 1
    pub amount: u32,
}

/// Bid presets for a client to display. The engine never applies these.
#[must_use]
pub fn suggested_bids(estimate: FareEstimate) -> [SuggestedBid; 4] {
    BID_MULTIPLIERS.map(|multiplier| {
        let scaled = (f64::from(estimate.amount) * multiplier).round();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // clamped to u32 range
        let amount = scaled.clamp(1.0, f64::from(u32::MAX)) as u32;
        SuggestedBid { multiplier, amount }
    })
}
