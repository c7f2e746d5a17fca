//! Notices sent to riders and drivers through an external notifier.
//!
//! Delivery is fire-and-forget: the engine never waits on a notifier and a
//! failed notice never fails the operation that produced it.

use crate::ride::CancelledBy;
use crate::types::{AccountId, GeoPoint, RideId};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Something a participant should hear about.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum Notice {
    /// A bid was aimed at this driver.
    BidPosted {
        /// Ride id
        ride_id: RideId,
        /// Targeted driver
        driver_id: AccountId,
        /// Offered fare
        fare: u32,
    },
    /// A driver won the rider's request.
    RideAccepted {
        /// Ride id
        ride_id: RideId,
        /// Rider to notify
        rider_id: AccountId,
        /// Winning driver
        driver_id: AccountId,
    },
    /// Driver reached the pickup point.
    DriverArrived {
        /// Ride id
        ride_id: RideId,
        /// Rider to notify
        rider_id: AccountId,
    },
    /// Trip started.
    TripStarted {
        /// Ride id
        ride_id: RideId,
        /// Rider to notify
        rider_id: AccountId,
    },
    /// Trip ended; rider must complete online payment.
    PaymentRequested {
        /// Ride id
        ride_id: RideId,
        /// Rider to notify
        rider_id: AccountId,
        /// Amount due
        amount: u32,
    },
    /// Trip settled.
    TripCompleted {
        /// Ride id
        ride_id: RideId,
        /// Rider to notify
        rider_id: AccountId,
        /// Fare charged
        fare: u32,
    },
    /// Ride cancelled by the other party.
    RideCancelled {
        /// Ride id
        ride_id: RideId,
        /// Party to notify
        recipient: AccountId,
        /// Who cancelled
        by: CancelledBy,
    },
    /// Emergency raised during a ride.
    Sos {
        /// Ride id
        ride_id: RideId,
        /// Raising account
        raised_by: AccountId,
        /// Last known position of the raising account
        location: Option<GeoPoint>,
    },
}

impl Notice {
    /// Account the notice is addressed to; `None` for SOS, which goes to the
    /// safety desk.
    #[must_use]
    pub const fn recipient(&self) -> Option<AccountId> {
        match self {
            Self::BidPosted { driver_id, .. } => Some(*driver_id),
            Self::RideAccepted { rider_id, .. }
            | Self::DriverArrived { rider_id, .. }
            | Self::TripStarted { rider_id, .. }
            | Self::PaymentRequested { rider_id, .. }
            | Self::TripCompleted { rider_id, .. } => Some(*rider_id),
            Self::RideCancelled { recipient, .. } => Some(*recipient),
            Self::Sos { .. } => None,
        }
    }

    /// Ride the notice concerns.
    #[must_use]
    pub const fn ride_id(&self) -> RideId {
        match self {
            Self::BidPosted { ride_id, .. }
            | Self::RideAccepted { ride_id, .. }
            | Self::DriverArrived { ride_id, .. }
            | Self::TripStarted { ride_id, .. }
            | Self::PaymentRequested { ride_id, .. }
            | Self::TripCompleted { ride_id, .. }
            | Self::RideCancelled { ride_id, .. }
            | Self::Sos { ride_id, .. } => *ride_id,
        }
    }

    /// Short name for logs and metrics labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BidPosted { .. } => "bid_posted",
            Self::RideAccepted { .. } => "ride_accepted",
            Self::DriverArrived { .. } => "driver_arrived",
            Self::TripStarted { .. } => "trip_started",
            Self::PaymentRequested { .. } => "payment_requested",
            Self::TripCompleted { .. } => "trip_completed",
            Self::RideCancelled { .. } => "ride_cancelled",
            Self::Sos { .. } => "sos",
        }
    }
}

/// Notifier failure. Logged, never propagated to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Notification failed: {0}")]
pub struct NotifyError(pub String);

/// Push-notification / SOS dispatch collaborator.
pub trait Notifier: Send + Sync {
    /// Hand one notice to the delivery system.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] if the delivery system rejected the notice.
    fn notify(&self, notice: Notice) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sos_has_no_account_recipient() {
        let notice = Notice::Sos {
            ride_id: RideId::new(),
            raised_by: AccountId::new(),
            location: None,
        };
        assert_eq!(notice.recipient(), None);
        assert_eq!(notice.kind(), "sos");
    }

    #[test]
    fn notices_serialize_with_a_type_tag() {
        let rider_id = AccountId::new();
        let notice = Notice::DriverArrived {
            ride_id: RideId::new(),
            rider_id,
        };
        let json = serde_json::to_value(&notice).unwrap_or_default();
        assert_eq!(json["type"], "DRIVER_ARRIVED");
        assert_eq!(json["riderId"], rider_id.to_string());
    }
}
