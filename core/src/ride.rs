//! Ride requests: status, phases and the flat wire record.
//!
//! In memory a ride's status-dependent data lives in [`RidePhase`], so a
//! `Searching` ride cannot carry a driver and a `Completed` ride cannot lack
//! one. The store and clients see the flat [`RideRecord`]; converting a
//! record back into a [`RideRequest`] rejects field combinations that
//! contradict the status.

use crate::types::{AccountId, GeoPoint, Location, PaymentMethod, RideId, RidePreferences, VehicleCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::types::ParseEnumError;

// ============================================================================
// Status
// ============================================================================

/// Ride status as stored and shown to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    /// Waiting for a driver to accept
    Searching,
    /// A driver won the request and is heading to pickup
    Accepted,
    /// Driver is at the pickup point
    Arrived,
    /// Trip in progress
    Started,
    /// Trip ended; waiting for online payment capture
    PaymentPending,
    /// Trip finished and settled
    Completed,
    /// Cancelled before starting
    Cancelled,
}

impl RideStatus {
    /// Statuses in which a trip is assigned and not yet over.
    pub const ACTIVE: [Self; 4] = [
        Self::Accepted,
        Self::Arrived,
        Self::Started,
        Self::PaymentPending,
    ];

    /// Every status.
    pub const ALL: [Self; 7] = [
        Self::Searching,
        Self::Accepted,
        Self::Arrived,
        Self::Started,
        Self::PaymentPending,
        Self::Completed,
        Self::Cancelled,
    ];

    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Searching => "SEARCHING",
            Self::Accepted => "ACCEPTED",
            Self::Arrived => "ARRIVED",
            Self::Started => "STARTED",
            Self::PaymentPending => "PAYMENT_PENDING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// `COMPLETED` or `CANCELLED`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Assigned to a driver and not over yet.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::Arrived | Self::Started | Self::PaymentPending
        )
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RideStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("ride status", s))
    }
}

// ============================================================================
// Value types
// ============================================================================

/// Error for a malformed trip code or rating.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// Trip codes are exactly six ASCII digits.
    #[error("Trip code must be six digits")]
    TripCode,
    /// Ratings are whole stars from 1 to 5.
    #[error("Rating must be between 1 and 5, got {0}")]
    Rating(u8),
}

/// Six-digit one-time code the rider gives the driver to start the trip.
///
/// Issued once at creation and never changed.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TripCode(String);

impl TripCode {
    /// Number of digits in a code.
    pub const LENGTH: usize = 6;

    /// Zero-padded code for `value`; `None` if it has more than six digits.
    #[must_use]
    pub fn from_number(value: u32) -> Option<Self> {
        (value < 1_000_000).then(|| Self(format!("{value:06}")))
    }

    /// The code digits
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `candidate` (surrounding whitespace ignored) is this code.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        self.0 == candidate.trim()
    }
}

impl fmt::Debug for TripCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TripCode(******)")
    }
}

impl TryFrom<String> for TripCode {
    type Error = ValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.len() == Self::LENGTH && value.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(value))
        } else {
            Err(ValueError::TripCode)
        }
    }
}

impl FromStr for TripCode {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl From<TripCode> for String {
    fn from(code: TripCode) -> Self {
        code.0
    }
}

/// A rider's 1 to 5 star rating of a trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rating(u8);

impl Rating {
    /// Validates a star count.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::Rating`] outside `1..=5`.
    pub const fn new(stars: u8) -> Result<Self, ValueError> {
        if stars >= 1 && stars <= 5 {
            Ok(Self(stars))
        } else {
            Err(ValueError::Rating(stars))
        }
    }

    /// Star count
    #[must_use]
    pub const fn stars(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Rating {
    type Error = ValueError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Rating> for u8 {
    fn from(rating: Rating) -> Self {
        rating.0
    }
}

/// Who cancelled a ride.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelledBy {
    /// The ride's rider
    Rider,
    /// The assigned driver
    Driver,
    /// Internal collaborator (request expiry)
    System,
}

/// Record of a cancellation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cancellation {
    /// Cancelling party
    pub by: CancelledBy,
    /// Reason; always present for cancellations after acceptance
    pub reason: Option<String>,
    /// When the ride was cancelled
    pub at: DateTime<Utc>,
}

/// The driver that won a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Assignment {
    /// Winning driver
    pub driver_id: AccountId,
    /// When the accept committed
    pub accepted_at: DateTime<Utc>,
}

// ============================================================================
// Phases
// ============================================================================

/// Status together with exactly the data valid in that status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RidePhase {
    /// Waiting for a driver
    Searching,
    /// Driver assigned
    Accepted {
        /// Winning driver
        assignment: Assignment,
    },
    /// Driver at pickup
    Arrived {
        /// Winning driver
        assignment: Assignment,
        /// Arrival time
        arrived_at: DateTime<Utc>,
    },
    /// Trip in progress
    Started {
        /// Winning driver
        assignment: Assignment,
        /// Arrival time
        arrived_at: DateTime<Utc>,
        /// Start time
        started_at: DateTime<Utc>,
    },
    /// Trip ended, awaiting payment capture
    PaymentPending {
        /// Winning driver
        assignment: Assignment,
        /// Arrival time
        arrived_at: DateTime<Utc>,
        /// Start time
        started_at: DateTime<Utc>,
        /// When the driver ended the trip
        ended_at: DateTime<Utc>,
    },
    /// Settled
    Completed {
        /// Winning driver
        assignment: Assignment,
        /// Arrival time
        arrived_at: DateTime<Utc>,
        /// Start time
        started_at: DateTime<Utc>,
        /// When the driver ended the trip
        ended_at: DateTime<Utc>,
        /// When settlement committed
        completed_at: DateTime<Utc>,
        /// Rider's rating once submitted
        rating: Option<Rating>,
    },
    /// Cancelled before the trip started
    Cancelled {
        /// Driver, if the ride had been accepted
        assignment: Option<Assignment>,
        /// Arrival time, if the driver had arrived
        arrived_at: Option<DateTime<Utc>>,
        /// Who cancelled and why
        cancellation: Cancellation,
    },
}

impl RidePhase {
    /// Status of this phase.
    #[must_use]
    pub const fn status(&self) -> RideStatus {
        match self {
            Self::Searching => RideStatus::Searching,
            Self::Accepted { .. } => RideStatus::Accepted,
            Self::Arrived { .. } => RideStatus::Arrived,
            Self::Started { .. } => RideStatus::Started,
            Self::PaymentPending { .. } => RideStatus::PaymentPending,
            Self::Completed { .. } => RideStatus::Completed,
            Self::Cancelled { .. } => RideStatus::Cancelled,
        }
    }

    /// Driver assignment, if any.
    #[must_use]
    pub const fn assignment(&self) -> Option<&Assignment> {
        match self {
            Self::Searching => None,
            Self::Accepted { assignment }
            | Self::Arrived { assignment, .. }
            | Self::Started { assignment, .. }
            | Self::PaymentPending { assignment, .. }
            | Self::Completed { assignment, .. } => Some(assignment),
            Self::Cancelled { assignment, .. } => assignment.as_ref(),
        }
    }
}

// ============================================================================
// Ride request
// ============================================================================

/// What a rider asks for; the engine adds id, code and timestamps.
#[derive(Clone, Debug, PartialEq)]
pub struct RideDraft {
    /// Requesting rider
    pub rider_id: AccountId,
    /// Pickup point
    pub pickup: Location,
    /// Drop point
    pub drop: Location,
    /// Requested tier
    pub category: VehicleCategory,
    /// Agreed fare in whole currency units
    pub fare: u32,
    /// Payment method
    pub payment_method: PaymentMethod,
    /// Comfort preferences
    pub preferences: RidePreferences,
    /// Bid aimed at a single driver
    pub target_driver_id: Option<AccountId>,
}

/// A ride request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RideRecord", into = "RideRecord")]
pub struct RideRequest {
    /// Ride id
    pub id: RideId,
    /// Requesting rider
    pub rider_id: AccountId,
    /// Pickup point
    pub pickup: Location,
    /// Drop point
    pub drop: Location,
    /// Requested tier
    pub category: VehicleCategory,
    /// Agreed fare in whole currency units
    pub fare: u32,
    /// One-time start code
    pub trip_code: TripCode,
    /// Payment method
    pub payment_method: PaymentMethod,
    /// Comfort preferences
    pub preferences: RidePreferences,
    /// Bid aimed at a single driver
    pub target_driver_id: Option<AccountId>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Status and status-specific data
    pub phase: RidePhase,
}

impl RideRequest {
    /// A new `SEARCHING` request.
    #[must_use]
    pub fn searching(draft: RideDraft, trip_code: TripCode, created_at: DateTime<Utc>) -> Self {
        Self {
            id: RideId::new(),
            rider_id: draft.rider_id,
            pickup: draft.pickup,
            drop: draft.drop,
            category: draft.category,
            fare: draft.fare,
            trip_code,
            payment_method: draft.payment_method,
            preferences: draft.preferences,
            target_driver_id: draft.target_driver_id,
            created_at,
            phase: RidePhase::Searching,
        }
    }

    /// Current status
    #[must_use]
    pub const fn status(&self) -> RideStatus {
        self.phase.status()
    }

    /// Assigned driver, if any
    #[must_use]
    pub fn driver_id(&self) -> Option<AccountId> {
        self.phase.assignment().map(|assignment| assignment.driver_id)
    }

    /// Whether `account` is this ride's rider or assigned driver.
    #[must_use]
    pub fn involves(&self, account: AccountId) -> bool {
        self.rider_id == account || self.driver_id() == Some(account)
    }

    /// Whether a driver may see and accept this request.
    #[must_use]
    pub fn is_open_to(&self, driver: AccountId) -> bool {
        self.target_driver_id.is_none_or(|target| target == driver)
    }

    /// Rider's rating, once submitted.
    #[must_use]
    pub const fn rating(&self) -> Option<Rating> {
        match &self.phase {
            RidePhase::Completed { rating, .. } => *rating,
            _ => None,
        }
    }

    /// Straight-line pickup distance from `from`.
    #[must_use]
    pub fn pickup_distance_km(&self, from: &GeoPoint) -> f64 {
        self.pickup.point.distance_km(from)
    }
}

// ============================================================================
// Wire record
// ============================================================================

/// Flat, camelCase ride document: the shape stored and sent to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRecord {
    /// Ride id
    pub id: RideId,
    /// Requesting rider
    pub rider_id: AccountId,
    /// Assigned driver
    #[serde(default)]
    pub driver_id: Option<AccountId>,
    /// Bid aimed at a single driver
    #[serde(default)]
    pub target_driver_id: Option<AccountId>,
    /// Pickup point
    pub pickup: Location,
    /// Drop point
    pub drop: Location,
    /// Requested tier
    pub vehicle_category: VehicleCategory,
    /// Status
    pub status: RideStatus,
    /// Agreed fare
    pub agreed_fare: u32,
    /// One-time start code
    pub otp: String,
    /// Payment method
    pub payment_method: PaymentMethod,
    /// Comfort preferences
    #[serde(default)]
    pub preferences: RidePreferences,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Acceptance time
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    /// Arrival time
    #[serde(default)]
    pub arrived_at: Option<DateTime<Utc>>,
    /// Trip start time
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Trip end time
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Completion time
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Cancellation time
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Cancelling party
    #[serde(default)]
    pub cancelled_by: Option<CancelledBy>,
    /// Cancellation reason
    #[serde(default)]
    pub cancellation_reason: Option<String>,
    /// Rider's rating
    #[serde(default)]
    pub rating: Option<u8>,
}

/// A ride record whose fields contradict its status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Status requires a field that is missing.
    #[error("{status} ride is missing {field}")]
    Missing {
        /// Record status
        status: RideStatus,
        /// Missing field
        field: &'static str,
    },
    /// Field is set but not valid in this status.
    #[error("{status} ride must not have {field}")]
    Unexpected {
        /// Record status
        status: RideStatus,
        /// Offending field
        field: &'static str,
    },
    /// Trip code or rating malformed.
    #[error(transparent)]
    Value(#[from] ValueError),
    /// Agreed fare must be positive.
    #[error("Agreed fare must be positive")]
    ZeroFare,
}

fn require<T>(value: Option<T>, status: RideStatus, field: &'static str) -> Result<T, RecordError> {
    match value {
        Some(value) => Ok(value),
        None => Err(RecordError::Missing { status, field }),
    }
}

fn forbid<T>(value: &Option<T>, status: RideStatus, field: &'static str) -> Result<(), RecordError> {
    match value {
        Some(_) => Err(RecordError::Unexpected { status, field }),
        None => Ok(()),
    }
}

impl RideRecord {
    fn assignment(&self) -> Result<Assignment, RecordError> {
        Ok(Assignment {
            driver_id: require(self.driver_id, self.status, "driverId")?,
            accepted_at: require(self.accepted_at, self.status, "acceptedAt")?,
        })
    }

    fn phase(&self) -> Result<RidePhase, RecordError> {
        let status = self.status;
        if status != RideStatus::Completed {
            forbid(&self.rating, status, "rating")?;
            forbid(&self.completed_at, status, "completedAt")?;
        }
        if status != RideStatus::Cancelled {
            forbid(&self.cancelled_at, status, "cancelledAt")?;
            forbid(&self.cancelled_by, status, "cancelledBy")?;
            forbid(&self.cancellation_reason, status, "cancellationReason")?;
        }

        let phase = match status {
            RideStatus::Searching => {
                forbid(&self.driver_id, status, "driverId")?;
                forbid(&self.accepted_at, status, "acceptedAt")?;
                forbid(&self.arrived_at, status, "arrivedAt")?;
                forbid(&self.started_at, status, "startedAt")?;
                forbid(&self.ended_at, status, "endedAt")?;
                RidePhase::Searching
            },
            RideStatus::Accepted => {
                forbid(&self.arrived_at, status, "arrivedAt")?;
                forbid(&self.started_at, status, "startedAt")?;
                forbid(&self.ended_at, status, "endedAt")?;
                RidePhase::Accepted {
                    assignment: self.assignment()?,
                }
            },
            RideStatus::Arrived => {
                forbid(&self.started_at, status, "startedAt")?;
                forbid(&self.ended_at, status, "endedAt")?;
                RidePhase::Arrived {
                    assignment: self.assignment()?,
                    arrived_at: require(self.arrived_at, status, "arrivedAt")?,
                }
            },
            RideStatus::Started => {
                forbid(&self.ended_at, status, "endedAt")?;
                RidePhase::Started {
                    assignment: self.assignment()?,
                    arrived_at: require(self.arrived_at, status, "arrivedAt")?,
                    started_at: require(self.started_at, status, "startedAt")?,
                }
            },
            RideStatus::PaymentPending => RidePhase::PaymentPending {
                assignment: self.assignment()?,
                arrived_at: require(self.arrived_at, status, "arrivedAt")?,
                started_at: require(self.started_at, status, "startedAt")?,
                ended_at: require(self.ended_at, status, "endedAt")?,
            },
            RideStatus::Completed => RidePhase::Completed {
                assignment: self.assignment()?,
                arrived_at: require(self.arrived_at, status, "arrivedAt")?,
                started_at: require(self.started_at, status, "startedAt")?,
                ended_at: require(self.ended_at, status, "endedAt")?,
                completed_at: require(self.completed_at, status, "completedAt")?,
                rating: self.rating.map(Rating::new).transpose()?,
            },
            RideStatus::Cancelled => {
                forbid(&self.started_at, status, "startedAt")?;
                forbid(&self.ended_at, status, "endedAt")?;
                let assignment = match (self.driver_id, self.accepted_at) {
                    (None, None) => {
                        forbid(&self.arrived_at, status, "arrivedAt")?;
                        None
                    },
                    _ => Some(self.assignment()?),
                };
                RidePhase::Cancelled {
                    assignment,
                    arrived_at: self.arrived_at,
                    cancellation: Cancellation {
                        by: require(self.cancelled_by, status, "cancelledBy")?,
                        reason: self.cancellation_reason.clone(),
                        at: require(self.cancelled_at, status, "cancelledAt")?,
                    },
                }
            },
        };
        Ok(phase)
    }
}

impl TryFrom<RideRecord> for RideRequest {
    type Error = RecordError;

    fn try_from(record: RideRecord) -> Result<Self, Self::Error> {
        if record.agreed_fare == 0 {
            return Err(RecordError::ZeroFare);
        }
        let phase = record.phase()?;
        Ok(Self {
            id: record.id,
            rider_id: record.rider_id,
            pickup: record.pickup,
            drop: record.drop,
            category: record.vehicle_category,
            fare: record.agreed_fare,
            trip_code: TripCode::try_from(record.otp)?,
            payment_method: record.payment_method,
            preferences: record.preferences,
            target_driver_id: record.target_driver_id,
            created_at: record.created_at,
            phase,
        })
    }
}

impl From<RideRequest> for RideRecord {
    fn from(ride: RideRequest) -> Self {
        let mut record = Self {
            id: ride.id,
            rider_id: ride.rider_id,
            driver_id: ride.driver_id(),
            target_driver_id: ride.target_driver_id,
            pickup: ride.pickup,
            drop: ride.drop,
            vehicle_category: ride.category,
            status: ride.phase.status(),
            agreed_fare: ride.fare,
            otp: ride.trip_code.into(),
            payment_method: ride.payment_method,
            preferences: ride.preferences,
            created_at: ride.created_at,
            accepted_at: ride.phase.assignment().map(|assignment| assignment.accepted_at),
            arrived_at: None,
            started_at: None,
            ended_at: None,
            completed_at: None,
            cancelled_at: None,
            cancelled_by: None,
            cancellation_reason: None,
            rating: None,
        };

        match ride.phase {
            RidePhase::Searching | RidePhase::Accepted { .. } => {},
            RidePhase::Arrived { arrived_at, .. } => {
                record.arrived_at = Some(arrived_at);
            },
            RidePhase::Started {
                arrived_at,
                started_at,
                ..
            } => {
                record.arrived_at = Some(arrived_at);
                record.started_at = Some(started_at);
            },
            RidePhase::PaymentPending {
                arrived_at,
                started_at,
                ended_at,
                ..
            } => {
                record.arrived_at = Some(arrived_at);
                record.started_at = Some(started_at);
                record.ended_at = Some(ended_at);
            },
            RidePhase::Completed {
                arrived_at,
                started_at,
                ended_at,
                completed_at,
                rating,
                ..
            } => {
                record.arrived_at = Some(arrived_at);
                record.started_at = Some(started_at);
                record.ended_at = Some(ended_at);
                record.completed_at = Some(completed_at);
                record.rating = rating.map(Rating::stars);
            },
            RidePhase::Cancelled {
                arrived_at,
                cancellation,
                ..
            } => {
                record.arrived_at = arrived_at;
                record.cancelled_at = Some(cancellation.at);
                record.cancelled_by = Some(cancellation.by);
                record.cancellation_reason = cancellation.reason;
            },
        }
        record
    }
}
