//! # Ride Dispatch Core
//!
//! Domain types and pure logic for the ride dispatch engine.
//!
//! This crate has no I/O. It defines what a ride is, which status changes
//! are legal and who may make them, how a trip is settled, and the traits
//! through which the runtime reaches its collaborators.
//!
//! ## Core Concepts
//!
//! - **RideRequest**: a ride whose status-dependent data lives in a tagged
//!   [`ride::RidePhase`]; serialized as the flat [`ride::RideRecord`]
//! - **RideStateMachine**: pure `(ride, actor, command, now) -> Transition`
//! - **Settlement**: payout and rating math, committed by the runtime as one
//!   atomic batch
//! - **RideStore**: revision-checked documents, atomic batches, change feed
//! - **Environment**: clock, trip code source, estimator and notifier traits
//!
//! ## Example
//!
//! ```
//! use ride_dispatch_core::machine::{RideCommand, RideStateMachine};
//! use ride_dispatch_core::ride::{RideDraft, RideRequest, RideStatus, TripCode};
//! use ride_dispatch_core::types::*;
//! use chrono::Utc;
//!
//! let rider = AccountId::new();
//! let driver = AccountId::new();
//! let ride = RideRequest::searching(
//!     RideDraft {
//!         rider_id: rider,
//!         pickup: Location::new(GeoPoint::new(27.49, 77.67), "Station Road"),
//!         drop: Location::new(GeoPoint::new(27.50, 77.68), "Bus Stand"),
//!         category: VehicleCategory::Mini,
//!         fare: 250,
//!         payment_method: PaymentMethod::Cash,
//!         preferences: RidePreferences::default(),
//!         target_driver_id: None,
//!     },
//!     "123456".parse::<TripCode>().unwrap(),
//!     Utc::now(),
//! );
//!
//! let transition = RideStateMachine::new()
//!     .apply(&ride, &Actor::Driver(driver), RideCommand::Accept, Utc::now())
//!     .unwrap();
//! assert_eq!(transition.ride.status(), RideStatus::Accepted);
//! assert_eq!(transition.ride.driver_id(), Some(driver));
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod account;
pub mod error;
pub mod fare;
pub mod ledger;
pub mod machine;
pub mod notify;
pub mod ride;
pub mod settlement;
pub mod store;
pub mod types;

pub use error::{DispatchError, ErrorKind};

/// Environment module - injected dependencies
///
/// Everything the engine needs from the outside world that is not the store,
/// estimator or notifier.
pub mod environment {
    use crate::ride::TripCode;
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Source of one-time trip codes.
    pub trait CodeGenerator: Send + Sync {
        /// A fresh six-digit code.
        fn next_code(&self) -> TripCode;
    }
}
