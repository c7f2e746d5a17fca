//! Identifiers and value objects shared by every part of the dispatch engine.
//!
//! Serialized names follow the record schema the rider, driver and admin
//! clients already speak: enum values are `SCREAMING_SNAKE_CASE`, struct
//! fields are `camelCase`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for an account (rider, driver, admin or any mix).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Uuid);

impl AccountId {
    /// Creates a new random `AccountId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an `AccountId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a ride request
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RideId(Uuid);

impl RideId {
    /// Creates a new random `RideId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `RideId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RideId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RideId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a wallet ledger entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Creates a new random `TransactionId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `TransactionId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Geography
// ============================================================================

/// Mean Earth radius used by the haversine formula.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS84 coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lng: f64,
}

impl GeoPoint {
    /// Creates a new point. No range check; see [`GeoPoint::is_valid`].
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Whether both components are finite and inside their ranges.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Great-circle distance in kilometres (haversine).
    #[must_use]
    pub fn distance_km(&self, other: &Self) -> f64 {
        let (lat1, lon1) = (self.lat.to_radians(), self.lng.to_radians());
        let (lat2, lon2) = (other.lat.to_radians(), other.lng.to_radians());
        let sin_dlat = ((lat2 - lat1) * 0.5).sin();
        let sin_dlon = ((lon2 - lon1) * 0.5).sin();
        let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
        let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
        EARTH_RADIUS_KM * c
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.5}, {:.5})", self.lat, self.lng)
    }
}

/// A coordinate plus the address string shown to riders and drivers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Coordinates
    #[serde(flatten)]
    pub point: GeoPoint,
    /// Display address (free text; never geocoded here)
    pub address: String,
}

impl Location {
    /// Longest display address accepted, in characters.
    pub const MAX_ADDRESS_LEN: usize = 200;

    /// Creates a new location
    #[must_use]
    pub fn new(point: GeoPoint, address: impl Into<String>) -> Self {
        Self {
            point,
            address: address.into(),
        }
    }
}

// ============================================================================
// Enumerations
// ============================================================================

/// Error returned when parsing one of the wire enums from text fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown {kind} value: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Service tier; constrains which drivers may serve a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleCategory {
    /// Two-wheeler
    Bike,
    /// Three-wheeler
    Auto,
    /// Hatchback
    Mini,
    /// Sedan
    Sedan,
    /// SUV
    Suv,
    /// Women-only tier: served exclusively by female drivers
    Pink,
}

impl VehicleCategory {
    /// Every category, in display order.
    pub const ALL: [Self; 6] = [
        Self::Bike,
        Self::Auto,
        Self::Mini,
        Self::Sedan,
        Self::Suv,
        Self::Pink,
    ];

    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bike => "BIKE",
            Self::Auto => "AUTO",
            Self::Mini => "MINI",
            Self::Sedan => "SEDAN",
            Self::Suv => "SUV",
            Self::Pink => "PINK",
        }
    }

    /// Gender a driver must have to serve this category, if restricted.
    #[must_use]
    pub const fn required_driver_gender(self) -> Option<Gender> {
        match self {
            Self::Pink => Some(Gender::Female),
            _ => None,
        }
    }
}

impl fmt::Display for VehicleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleCategory {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError::new("vehicle category", s))
    }
}

/// Account gender, used only for gender-restricted categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Gender {
    /// Male
    Male,
    /// Female
    Female,
    /// Other / undisclosed
    Other,
}

/// How the rider pays for the trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    /// Cash handed to the driver
    Cash,
    /// UPI transfer, captured by the payment collaborator
    Upi,
    /// Card payment, captured by the payment collaborator
    Card,
    /// In-app wallet
    Wallet,
}

impl PaymentMethod {
    /// Whether completion must wait for an external payment capture.
    #[must_use]
    pub const fn requires_online_capture(self) -> bool {
        matches!(self, Self::Upi | Self::Card)
    }
}

/// Rider comfort preferences forwarded to the driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RidePreferences {
    /// Rider prefers no conversation
    pub silent: bool,
    /// Air conditioning requested
    pub ac: bool,
    /// Music allowed
    pub music: bool,
}

/// Role an account may hold. Rider and driver are not exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// May request rides
    Rider,
    /// May serve rides once approved
    Driver,
    /// May approve and deactivate accounts
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rider => "RIDER",
            Self::Driver => "DRIVER",
            Self::Admin => "ADMIN",
        };
        f.write_str(name)
    }
}

/// Authenticated caller, as asserted by the identity provider.
///
/// The engine trusts the account id but still checks the claimed role
/// against the stored account before acting on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Actor {
    /// Account acting as a rider
    Rider(AccountId),
    /// Account acting as a driver
    Driver(AccountId),
    /// Account acting as an administrator
    Admin(AccountId),
    /// Internal collaborator (payment capture, request expiry)
    System,
}

impl Actor {
    /// Account behind this actor, if any.
    #[must_use]
    pub const fn account_id(&self) -> Option<AccountId> {
        match self {
            Self::Rider(id) | Self::Driver(id) | Self::Admin(id) => Some(*id),
            Self::System => None,
        }
    }

    /// Role the actor claims.
    #[must_use]
    pub const fn role(&self) -> Option<Role> {
        match self {
            Self::Rider(_) => Some(Role::Rider),
            Self::Driver(_) => Some(Role::Driver),
            Self::Admin(_) => Some(Role::Admin),
            Self::System => None,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rider(id) => write!(f, "rider:{id}"),
            Self::Driver(id) => write!(f, "driver:{id}"),
            Self::Admin(id) => write!(f, "admin:{id}"),
            Self::System => f.write_str("system"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_between_nearby_points_is_about_one_and_a_half_km() {
        let pickup = GeoPoint::new(27.49, 77.67);
        let drop = GeoPoint::new(27.50, 77.68);

        let distance = pickup.distance_km(&drop);
        assert!(distance > 1.3 && distance < 1.6, "got {distance}");
        assert!((drop.distance_km(&pickup) - distance).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_points_are_invalid() {
        assert!(GeoPoint::new(27.49, 77.67).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, f64::NAN).is_valid());
    }

    #[test]
    fn vehicle_category_round_trips_through_text() {
        for category in VehicleCategory::ALL {
            assert_eq!(category.as_str().parse::<VehicleCategory>(), Ok(category));
        }
        assert_eq!("mini".parse::<VehicleCategory>(), Ok(VehicleCategory::Mini));
        assert!("HOVERCRAFT".parse::<VehicleCategory>().is_err());
    }

    #[test]
    fn only_pink_is_gender_restricted() {
        assert_eq!(
            VehicleCategory::Pink.required_driver_gender(),
            Some(Gender::Female)
        );
        assert_eq!(VehicleCategory::Mini.required_driver_gender(), None);
    }

    #[test]
    fn online_payment_methods_need_capture() {
        assert!(PaymentMethod::Upi.requires_online_capture());
        assert!(PaymentMethod::Card.requires_online_capture());
        assert!(!PaymentMethod::Cash.requires_online_capture());
        assert!(!PaymentMethod::Wallet.requires_online_capture());
    }

    #[test]
    fn location_serializes_flat() {
        let location = Location::new(GeoPoint::new(27.49, 77.67), "Gate 2");
        let json = serde_json::to_value(&location).unwrap_or_default();
        assert_eq!(json["lat"], 27.49);
        assert_eq!(json["address"], "Gate 2");
    }
}
