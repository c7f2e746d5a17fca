//! Local estimator: straight-line distance priced per kilometre.

use crate::config::{FareConfig, scale};
use ride_dispatch_core::fare::{EstimatorError, FareEstimate, FareEstimator, FareTable};
use ride_dispatch_core::types::{GeoPoint, VehicleCategory};
use std::future::Future;
use std::pin::Pin;

/// `(base + distance * per_km) * multiplier` per category, ETA from the
/// configured average speed. Never fails.
#[derive(Clone, Debug)]
pub struct DistanceFareEstimator {
    config: FareConfig,
}

impl DistanceFareEstimator {
    /// Estimator priced by `config`.
    #[must_use]
    pub const fn new(config: FareConfig) -> Self {
        Self { config }
    }

    /// Synchronous table for a trip.
    #[must_use]
    pub fn table(&self, pickup: GeoPoint, drop: GeoPoint) -> FareTable {
        let distance_km = pickup.distance_km(&drop);
        let base = f64::from(self.config.base_fare) + distance_km * f64::from(self.config.per_km);
        let minutes = (distance_km / self.config.average_speed_kmh * 60.0).ceil();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // clamped to the u32 range
        let eta_minutes = if minutes.is_finite() {
            minutes.clamp(1.0, f64::from(u32::MAX)) as u32
        } else {
            self.config.fallback_eta_minutes
        };

        VehicleCategory::ALL
            .into_iter()
            .map(|category| {
                let multiplier = self.config.multiplier(category);
                let amount = scale(1, base * multiplier);
                (category, FareEstimate { amount, eta_minutes })
            })
            .collect()
    }
}

impl FareEstimator for DistanceFareEstimator {
    fn estimate(
        &self,
        pickup: GeoPoint,
        drop: GeoPoint,
    ) -> Pin<Box<dyn Future<Output = Result<FareTable, EstimatorError>> + Send + '_>> {
        Box::pin(async move { Ok(self.table(pickup, drop)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;

    fn estimator() -> DistanceFareEstimator {
        DistanceFareEstimator::new(DispatchConfig::default().fare)
    }

    #[test]
    fn short_trip_is_priced_for_every_category() {
        let table = estimator().table(GeoPoint::new(27.49, 77.67), GeoPoint::new(27.50, 77.68));

        assert_eq!(table.missing().count(), 0);
        let mini = table.get(VehicleCategory::Mini);
        assert!(mini.is_some_and(|estimate| estimate.amount > 0 && estimate.eta_minutes > 0));
    }

    #[test]
    fn pricier_categories_cost_more() {
        let table = estimator().table(GeoPoint::new(12.97, 77.59), GeoPoint::new(12.93, 77.62));
        let amount = |category| table.get(category).map(|estimate| estimate.amount);

        assert!(amount(VehicleCategory::Bike) < amount(VehicleCategory::Mini));
        assert!(amount(VehicleCategory::Mini) < amount(VehicleCategory::Suv));
    }

    #[test]
    fn longer_trips_cost_more() {
        let from = GeoPoint::new(12.97, 77.59);
        let near = estimator().table(from, GeoPoint::new(12.96, 77.60));
        let far = estimator().table(from, GeoPoint::new(12.80, 77.70));

        let auto = |table: &FareTable| table.get(VehicleCategory::Auto).map(|estimate| estimate.amount);

        assert!(auto(&near) < auto(&far));
    }
}
