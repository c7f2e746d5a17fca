//! Circuit breaker around external collaborators.
//!
//! The fare estimator is the only remote call on the request path. When it
//! keeps failing the breaker opens and callers go straight to their fallback
//! instead of waiting out a timeout on every bid.
//!
//! # States
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls are rejected until `timeout` has passed.
//! - **HalfOpen**: trial calls pass; `success_threshold` successes close the
//!   circuit, one failure opens it again.
//!
//! # Example
//!
//! ```rust
//! use ride_dispatch_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new(
//!     "fare_estimator",
//!     CircuitBreakerConfig::builder()
//!         .failure_threshold(3)
//!         .timeout(Duration::from_secs(30))
//!         .build(),
//! );
//!
//! let result = breaker.call(|| async { Ok::<_, String>(42) }).await;
//! assert!(result.is_ok());
//! # }
//! ```

use crate::metrics::BreakerMetrics;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: usize,
    /// How long the circuit stays open before a trial call
    pub timeout: Duration,
    /// Successes in `HalfOpen` needed to close the circuit
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            timeout: None,
            success_threshold: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    timeout: Option<Duration>,
    success_threshold: Option<usize>,
}

impl CircuitBreakerConfigBuilder {
    /// Set failure threshold.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set how long the circuit stays open.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set success threshold for closing from `HalfOpen`.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold).max(1),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            success_threshold: self.success_threshold.unwrap_or(defaults.success_threshold).max(1),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Calls pass through
    Closed,
    /// Calls are rejected
    Open,
    /// Trial calls pass through
    HalfOpen,
}

impl State {
    const fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

/// Errors from circuit breaker calls.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open; the operation was not run
    #[error("Circuit breaker is open")]
    Open,
    /// The operation ran and failed
    #[error("Operation failed: {0}")]
    Inner(E),
}

#[derive(Debug)]
struct BreakerState {
    state: State,
    failure_count: usize,
    success_count: usize,
    opened_at: Option<Instant>,
}

/// Counters since creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerStats {
    /// Calls attempted, rejected ones included
    pub total_calls: u64,
    /// Calls that succeeded
    pub total_successes: u64,
    /// Calls that failed
    pub total_failures: u64,
    /// Calls rejected while open
    pub total_rejections: u64,
}

/// Circuit breaker. Clones share state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<RwLock<BreakerState>>,
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a closed breaker; `name` labels its logs and metrics.
    #[must_use]
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config: Arc::new(config),
            state: Arc::new(RwLock::new(BreakerState {
                state: State::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Breaker name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Current state.
    pub async fn state(&self) -> State {
        self.state.read().await.state
    }

    /// Run `operation` unless the circuit is open.
    ///
    /// # Errors
    ///
    /// [`CircuitBreakerError::Open`] without running the operation while the
    /// circuit is open, [`CircuitBreakerError::Inner`] when it fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        if !self.can_attempt().await {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            BreakerMetrics::record_rejection(self.name);
            tracing::debug!(breaker = self.name, "Circuit open, rejecting call");
            return Err(CircuitBreakerError::Open);
        }

        match operation().await {
            Ok(result) => {
                self.on_success().await;
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            },
            Err(err) => {
                self.on_failure().await;
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                Err(CircuitBreakerError::Inner(err))
            },
        }
    }

    async fn can_attempt(&self) -> bool {
        let mut state = self.state.write().await;

        match state.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let elapsed = state
                    .opened_at
                    .is_some_and(|opened| opened.elapsed() >= self.config.timeout);
                if elapsed {
                    tracing::info!(breaker = self.name, "Circuit breaker OPEN -> HALF_OPEN");
                    self.enter(&mut state, State::HalfOpen);
                    state.success_count = 0;
                }
                elapsed
            },
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.write().await;

        match state.state {
            State::Closed | State::Open => state.failure_count = 0,
            State::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    tracing::info!(breaker = self.name, "Circuit breaker HALF_OPEN -> CLOSED");
                    self.enter(&mut state, State::Closed);
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                }
            },
        }
    }

    async fn on_failure(&self) {
        let mut state = self.state.write().await;

        match state.state {
            State::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        breaker = self.name,
                        failures = state.failure_count,
                        "Circuit breaker CLOSED -> OPEN"
                    );
                    self.enter(&mut state, State::Open);
                    state.opened_at = Some(Instant::now());
                }
            },
            State::HalfOpen => {
                tracing::warn!(breaker = self.name, "Circuit breaker HALF_OPEN -> OPEN");
                self.enter(&mut state, State::Open);
                state.opened_at = Some(Instant::now());
                state.failure_count = 1;
                state.success_count = 0;
            },
            State::Open => state.failure_count += 1,
        }
    }

    fn enter(&self, state: &mut BreakerState, next: State) {
        state.state = next;
        BreakerMetrics::record_state(self.name, next.gauge_value());
    }

    /// Counters since creation.
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Force the breaker closed.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        tracing::info!(breaker = self.name, "Circuit breaker manually reset to CLOSED");
        self.enter(&mut state, State::Closed);
        state.failure_count = 0;
        state.success_count = 0;
        state.opened_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: usize, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::builder()
                .failure_threshold(failure_threshold)
                .timeout(timeout)
                .success_threshold(1)
                .build(),
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        breaker.call(|| async { Err::<(), _>("boom") }).await
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = breaker(2, Duration::from_secs(60));

        assert_eq!(fail(&breaker).await, Err(CircuitBreakerError::Inner("boom")));
        assert_eq!(breaker.state().await, State::Closed);
        assert_eq!(fail(&breaker).await, Err(CircuitBreakerError::Inner("boom")));
        assert_eq!(breaker.state().await, State::Open);
    }

    #[tokio::test]
    async fn open_circuit_skips_the_operation() {
        let breaker = breaker(1, Duration::from_secs(60));
        let _ = fail(&breaker).await;

        let mut ran = false;
        let result = breaker
            .call(|| {
                ran = true;
                async { Ok::<_, &str>(1) }
            })
            .await;

        assert_eq!(result, Err(CircuitBreakerError::Open));
        assert!(!ran);
        assert_eq!(breaker.stats().total_rejections, 1);
    }

    #[tokio::test]
    async fn success_resets_the_failure_count() {
        let breaker = breaker(2, Duration::from_secs(60));
        let _ = fail(&breaker).await;
        assert!(breaker.call(|| async { Ok::<_, &str>(()) }).await.is_ok());
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn half_open_trial_closes_or_reopens() {
        let breaker = breaker(1, Duration::from_millis(10));
        let _ = fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state().await, State::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.call(|| async { Ok::<_, &str>(()) }).await.is_ok());
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn reset_closes_the_circuit() {
        let breaker = breaker(1, Duration::from_secs(60));
        let _ = fail(&breaker).await;
        breaker.reset().await;
        assert_eq!(breaker.state().await, State::Closed);
        assert_eq!(breaker.stats().total_failures, 1);
    }
}
