//! Prometheus metrics for the dispatch engine.
//!
//! Recorders are zero-sized types with associated functions so call sites
//! stay one line long. Without an installed recorder every call is a no-op.
//!
//! # Example
//!
//! ```rust,no_run
//! use ride_dispatch_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use ride_dispatch_core::ride::RideStatus;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus exporter for the engine's metrics.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server that will report `addr` as its scrape address.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed. A recorder
    /// that is already installed (tests, embedding applications) is accepted.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Address the exporter reports.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "dispatch_accept_total",
        "Accept attempts by outcome (won, lost, rejected)"
    );
    describe_counter!(
        "dispatch_transitions_total",
        "Committed ride transitions by target status"
    );
    describe_counter!(
        "dispatch_commit_conflicts_total",
        "Revision conflicts that forced a re-read"
    );
    describe_histogram!(
        "dispatch_operation_duration_seconds",
        "Time spent in engine operations"
    );

    describe_counter!(
        "dispatch_settlements_total",
        "Atomic settlement batches committed (completion, rating)"
    );
    describe_counter!(
        "dispatch_settlement_aborts_total",
        "Settlement batches abandoned without writing"
    );

    describe_counter!(
        "fare_estimate_fallbacks_total",
        "Estimates served from configured defaults, by reason"
    );
    describe_histogram!(
        "fare_estimate_duration_seconds",
        "Latency of the external fare estimator"
    );

    describe_counter!("feed_snapshots_total", "Snapshots pushed to live feeds");
    describe_counter!("feed_reconnects_total", "Change feed resubscriptions");
    describe_counter!(
        "feed_stale_events_total",
        "Change events discarded as stale or duplicate"
    );

    describe_gauge!(
        "circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=open, 2=half-open)"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Calls rejected by an open circuit"
    );
}

/// Dispatch and lifecycle metrics.
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record an accept attempt: `won`, `lost` or `rejected`.
    pub fn record_accept(outcome: &'static str) {
        counter!("dispatch_accept_total", "outcome" => outcome).increment(1);
    }

    /// Record a committed transition into `status`.
    pub fn record_transition(status: RideStatus) {
        counter!("dispatch_transitions_total", "to" => status.as_str()).increment(1);
    }

    /// Record a revision conflict on commit.
    pub fn record_conflict() {
        counter!("dispatch_commit_conflicts_total").increment(1);
    }

    /// Record the duration of an engine operation.
    pub fn record_operation(operation: &'static str, duration: Duration) {
        histogram!("dispatch_operation_duration_seconds", "operation" => operation)
            .record(duration.as_secs_f64());
    }
}

/// Settlement metrics.
pub struct SettlementMetrics;

impl SettlementMetrics {
    /// Record a committed settlement batch: `completion` or `rating`.
    pub fn record_settlement(kind: &'static str) {
        counter!("dispatch_settlements_total", "kind" => kind).increment(1);
    }

    /// Record a settlement given up without writing.
    pub fn record_abort(kind: &'static str) {
        counter!("dispatch_settlement_aborts_total", "kind" => kind).increment(1);
    }
}

/// Fare estimation metrics.
pub struct FareMetrics;

impl FareMetrics {
    /// Record a fallback: `timeout`, `error`, `circuit_open` or `incomplete`.
    pub fn record_fallback(reason: &'static str) {
        counter!("fare_estimate_fallbacks_total", "reason" => reason).increment(1);
    }

    /// Record a call to the external estimator.
    pub fn record_estimate(duration: Duration) {
        histogram!("fare_estimate_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Live feed metrics.
pub struct FeedMetrics;

impl FeedMetrics {
    /// Record a snapshot pushed to a subscriber of `feed`.
    pub fn record_snapshot(feed: &'static str) {
        counter!("feed_snapshots_total", "feed" => feed).increment(1);
    }

    /// Record a resubscription.
    pub fn record_reconnect(feed: &'static str) {
        counter!("feed_reconnects_total", "feed" => feed).increment(1);
    }

    /// Record an event discarded as stale.
    pub fn record_stale() {
        counter!("feed_stale_events_total").increment(1);
    }
}

/// Circuit breaker metrics.
pub struct BreakerMetrics;

impl BreakerMetrics {
    /// Record the state of breaker `name` (0=closed, 1=open, 2=half-open).
    pub fn record_state(name: &'static str, state: f64) {
        gauge!("circuit_breaker_state", "breaker" => name).set(state);
    }

    /// Record a call rejected by breaker `name`.
    pub fn record_rejection(name: &'static str) {
        counter!("circuit_breaker_rejections_total", "breaker" => name).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::expect_used)] // Panics: Test will fail if the address is malformed
    fn server() -> MetricsServer {
        MetricsServer::new("127.0.0.1:0".parse().expect("valid address"))
    }

    #[test]
    fn new_server_has_no_handle() {
        let server = server();
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn start_tolerates_an_existing_recorder() {
        let mut first = server();
        let mut second = server();
        assert!(first.start().is_ok());
        assert!(second.start().is_ok());
    }

    #[test]
    fn recorded_metrics_show_up_in_render() {
        let mut server = server();
        assert!(server.start().is_ok());

        DispatchMetrics::record_accept("won");
        DispatchMetrics::record_transition(RideStatus::Accepted);
        SettlementMetrics::record_settlement("completion");
        FareMetrics::record_fallback("timeout");

        // Another test may own the global recorder; then this one has no handle.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("dispatch_accept_total"));
            assert!(rendered.contains("dispatch_transitions_total"));
            assert!(rendered.contains("dispatch_settlements_total"));
            assert!(rendered.contains("fare_estimate_fallbacks_total"));
        }
    }
}
