//! # Ride Dispatch Testing
//!
//! Testing utilities and helpers for the ride dispatch engine.
//!
//! This crate provides:
//! - [`InMemoryRideStore`]: CAS-correct store with a change feed and fault
//!   injection
//! - Mock implementations of environment traits (clock, trip codes, fare
//!   estimators, notifier)
//! - Account builders and sample rides
//! - [`TransitionTest`]: Given-When-Then harness for the state machine
//! - Property-based testing strategies
//!
//! ## Example
//!
//! ```ignore
//! use ride_dispatch_testing::{InMemoryRideStore, test_clock};
//! use ride_dispatch_testing::mocks::{RecordingNotifier, SequentialCodeGenerator, StaticFareEstimator};
//!
//! #[tokio::test]
//! async fn drivers_race_for_a_ride() {
//!     let store = Arc::new(InMemoryRideStore::new());
//!     let engine = DispatchEngine::builder()
//!         .store(store.clone())
//!         .estimator(Arc::new(StaticFareEstimator::flat(200, 4)))
//!         .notifier(Arc::new(RecordingNotifier::new()))
//!         .clock(Arc::new(test_clock()))
//!         .codes(Arc::new(SequentialCodeGenerator::new()))
//!         .build()?;
//!     // ...
//! }
//! ```

pub mod fixtures;
pub mod properties;
pub mod store;
pub mod transition_test;

/// Mock implementations for testing.
pub mod mocks {
    use chrono::{DateTime, Utc};
    use ride_dispatch_core::environment::{Clock, CodeGenerator};
    use ride_dispatch_core::fare::{EstimatorError, FareEstimate, FareEstimator, FareTable};
    use ride_dispatch_core::notify::{Notice, Notifier, NotifyError};
    use ride_dispatch_core::ride::TripCode;
    use ride_dispatch_core::types::{GeoPoint, VehicleCategory};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use ride_dispatch_testing::mocks::FixedClock;
    /// use ride_dispatch_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Always hands out the same trip code.
    #[derive(Debug, Clone)]
    pub struct FixedCodeGenerator {
        code: TripCode,
    }

    impl FixedCodeGenerator {
        /// Generator returning `code` every time
        #[must_use]
        pub const fn new(code: TripCode) -> Self {
            Self { code }
        }
    }

    impl CodeGenerator for FixedCodeGenerator {
        fn next_code(&self) -> TripCode {
            self.code.clone()
        }
    }

    /// Hands out 000001, 000002, ... wrapping after 999999.
    #[derive(Debug, Default)]
    pub struct SequentialCodeGenerator {
        next: AtomicU32,
    }

    impl SequentialCodeGenerator {
        /// Generator starting at 000001
        #[must_use]
        pub const fn new() -> Self {
            Self {
                next: AtomicU32::new(0),
            }
        }
    }

    impl CodeGenerator for SequentialCodeGenerator {
        #[allow(clippy::expect_used)] // value is reduced below 1_000_000
        fn next_code(&self) -> TripCode {
            let value = self.next.fetch_add(1, Ordering::Relaxed) % 999_999 + 1;
            TripCode::from_number(value).expect("sequential code has six digits")
        }
    }

    /// Returns a fixed table, optionally after a delay.
    #[derive(Debug, Clone)]
    pub struct StaticFareEstimator {
        table: FareTable,
        delay: Option<Duration>,
        calls: Arc<AtomicU32>,
    }

    impl StaticFareEstimator {
        /// Estimator answering with `table`
        #[must_use]
        pub fn new(table: FareTable) -> Self {
            Self {
                table,
                delay: None,
                calls: Arc::new(AtomicU32::new(0)),
            }
        }

        /// Same estimate for every category
        #[must_use]
        pub fn flat(amount: u32, eta_minutes: u32) -> Self {
            Self::new(
                VehicleCategory::ALL
                    .into_iter()
                    .map(|category| (category, FareEstimate { amount, eta_minutes }))
                    .collect(),
            )
        }

        /// Answer only after `delay`
        #[must_use]
        pub fn delayed(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Number of estimate calls received
        #[must_use]
        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl FareEstimator for StaticFareEstimator {
        fn estimate(
            &self,
            _pickup: GeoPoint,
            _drop: GeoPoint,
        ) -> Pin<Box<dyn Future<Output = Result<FareTable, EstimatorError>> + Send + '_>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(self.table.clone())
            })
        }
    }

    /// Always fails, counting calls.
    #[derive(Debug, Clone, Default)]
    pub struct FailingFareEstimator {
        calls: Arc<AtomicU32>,
    }

    impl FailingFareEstimator {
        /// Create a failing estimator
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of estimate calls received
        #[must_use]
        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl FareEstimator for FailingFareEstimator {
        fn estimate(
            &self,
            _pickup: GeoPoint,
            _drop: GeoPoint,
        ) -> Pin<Box<dyn Future<Output = Result<FareTable, EstimatorError>> + Send + '_>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(EstimatorError::Unavailable("estimator offline".to_string()))
            })
        }
    }

    /// Captures every notice it is handed.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingNotifier {
        notices: Arc<Mutex<Vec<Notice>>>,
    }

    impl RecordingNotifier {
        /// Create an empty recorder
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Notices received so far
        #[must_use]
        pub fn notices(&self) -> Vec<Notice> {
            self.notices
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }

        /// Wait until a notice of `kind` arrives or `timeout` elapses.
        ///
        /// Notices are delivered from spawned tasks, so tests poll.
        pub async fn wait_for(&self, kind: &str, timeout: Duration) -> Option<Notice> {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if let Some(notice) = self.notices().into_iter().find(|n| n.kind() == kind) {
                    return Some(notice);
                }
                if tokio::time::Instant::now() >= deadline {
                    return None;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, notice: Notice) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>> {
            Box::pin(async move {
                self.notices
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(notice);
                Ok(())
            })
        }
    }
}

/// Install a test-friendly tracing subscriber once per process.
///
/// Output goes through the test writer, so it only shows for failing tests.
pub fn init_test_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use fixtures::AccountBuilder;
pub use mocks::{FixedClock, test_clock};
pub use store::InMemoryRideStore;
pub use transition_test::TransitionTest;

#[cfg(test)]
mod tests {
    use super::*;
    use ride_dispatch_core::environment::{Clock, CodeGenerator};
    use ride_dispatch_core::fare::FareEstimator;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn sequential_codes_are_distinct_six_digit_strings() {
        let codes = mocks::SequentialCodeGenerator::new();
        let first = codes.next_code();
        let second = codes.next_code();
        assert_eq!(first.as_str(), "000001");
        assert_eq!(second.as_str(), "000002");
    }

    #[test]
    fn failing_estimator_counts_calls() {
        let estimator = mocks::FailingFareEstimator::new();
        let result = tokio_test::block_on(
            estimator.estimate(fixtures::pickup_point(), fixtures::drop_point()),
        );
        assert!(result.is_err());
        assert_eq!(estimator.calls(), 1);
    }
}
