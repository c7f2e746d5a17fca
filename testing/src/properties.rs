//! Property-based testing strategies for domain types.

use proptest::prelude::*;
use ride_dispatch_core::ride::{Rating, TripCode};
use ride_dispatch_core::types::{GeoPoint, VehicleCategory};

/// Any vehicle category.
pub fn any_category() -> impl Strategy<Value = VehicleCategory> {
    proptest::sample::select(VehicleCategory::ALL.to_vec())
}

/// Any valid rating.
pub fn any_rating() -> impl Strategy<Value = Rating> {
    (1u8..=5).prop_filter_map("rating in range", |stars| Rating::new(stars).ok())
}

/// Any valid trip code.
pub fn any_trip_code() -> impl Strategy<Value = TripCode> {
    (0u32..1_000_000).prop_filter_map("six digits", TripCode::from_number)
}

/// A point within roughly ten kilometres of `center`.
pub fn point_near(center: GeoPoint) -> impl Strategy<Value = GeoPoint> {
    (-0.09f64..0.09, -0.09f64..0.09)
        .prop_map(move |(dlat, dlng)| GeoPoint::new(center.lat + dlat, center.lng + dlng))
}

/// Fares a rider could plausibly bid.
pub fn any_fare() -> impl Strategy<Value = u32> {
    1u32..5_000
}
