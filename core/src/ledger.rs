//! Append-only wallet ledger entries.

use crate::types::{AccountId, RideId, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of ledger entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    /// Fare credited to the driver on completion. At most one per ride.
    TripEarning,
}

impl TransactionKind {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TripEarning => "TRIP_EARNING",
        }
    }
}

/// One wallet movement, written only by settlement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletTransaction {
    /// Entry id
    pub id: TransactionId,
    /// Credited account
    pub account_id: AccountId,
    /// Ride that produced the entry
    pub ride_id: RideId,
    /// Signed amount in whole currency units
    pub amount: i64,
    /// Entry kind
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    /// Human readable description
    pub description: String,
    /// When the entry was written
    pub timestamp: DateTime<Utc>,
}

impl WalletTransaction {
    /// The trip earning entry for `ride_id`.
    #[must_use]
    pub fn trip_earning(
        account_id: AccountId,
        ride_id: RideId,
        amount: i64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            account_id,
            ride_id,
            amount,
            kind: TransactionKind::TripEarning,
            description: format!("Trip earning for ride {ride_id}"),
            timestamp,
        }
    }
}
