//! # Ride Dispatch Runtime
//!
//! Async engine for the ride dispatch core.
//!
//! This crate commits the pure state machine's transitions against a
//! [`RideStore`](ride_dispatch_core::store::RideStore), resolves accept races,
//! settles completed trips atomically and serves live views to drivers and
//! riders.
//!
//! ## Core Components
//!
//! - **DispatchEngine**: facade wiring every component onto one environment,
//!   with per-operation timeouts
//! - **AcceptanceArbiter**: first revision-checked commit wins a request
//! - **RideLifecycle**: arrive, start, end, confirm payment, cancel
//! - **SettlementEngine**: payout and rating in single atomic batches
//! - **FareNegotiationEngine**: estimates behind a circuit breaker, rider bids
//! - **DispatchBroadcaster** / **Session**: live pending and active-trip feeds
//!
//! ## Example
//!
//! ```ignore
//! use ride_dispatch_runtime::{DispatchEngine, BidRequest};
//!
//! let engine = DispatchEngine::builder().store(store).build()?;
//!
//! let ride = engine.propose_bid(&rider, BidRequest::new(pickup, drop, VehicleCategory::Mini, Some(250))).await?;
//! match engine.accept(&driver, ride.id).await? {
//!     AcceptOutcome::Won(ride) => println!("assigned {}", ride.id),
//!     AcceptOutcome::Lost { .. } => println!("someone else was faster"),
//! }
//! ```

/// Account registration, availability and administration
pub mod accounts;

/// First-accept-wins arbitration
pub mod arbiter;

/// Live pending and active-trip views
pub mod broadcaster;

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Random trip codes
pub mod codes;

mod commit;

/// Environment-driven configuration
pub mod config;

/// Engine facade and builder
pub mod engine;

/// Collaborators the engine runs against
pub mod environment;

/// Fare estimation and bids
pub mod fare;

/// Ride status transitions after acceptance
pub mod lifecycle;

/// Prometheus metrics for observability
pub mod metrics;

/// Notification sink that logs
pub mod notify;

/// Retry logic with exponential backoff
pub mod retry;

/// Per-account live subscriptions
pub mod session;

/// Payouts and ratings
pub mod settlement;

pub use accounts::{AccountDirectory, Registration};
pub use arbiter::{AcceptOutcome, AcceptanceArbiter};
pub use broadcaster::{DispatchBroadcaster, LiveFeed, PendingFilter, PendingSnapshot};
pub use config::{ConfigError, DispatchConfig};
pub use engine::{BuildError, DispatchEngine, DispatchEngineBuilder};
pub use environment::DispatchEnvironment;
pub use fare::{BidRequest, FareNegotiationEngine, FareQuote, QuoteSource};
pub use lifecycle::RideLifecycle;
pub use session::Session;
pub use settlement::{RatingReceipt, SettlementEngine};
