//! `PostgreSQL` ride store for the ride dispatch engine.
//!
//! Implements [`RideStore`](ride_dispatch_core::store::RideStore) on top of
//! sqlx:
//!
//! - Rides and accounts as JSONB documents with a revision column
//! - Write batches applied in one transaction, each put conditional on the
//!   revision it expects
//! - At most one `TRIP_EARNING` per ride, enforced by a unique index
//! - Change feed over `LISTEN/NOTIFY`; notifications are sent inside the
//!   committing transaction, so listeners only see committed writes
//!
//! # Example
//!
//! ```ignore
//! use ride_dispatch_postgres::PostgresRideStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresRideStore::new("postgres://localhost/dispatch", 10).await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod feed;
mod store;

pub use feed::CHANGE_CHANNEL;
pub use store::PostgresRideStore;
