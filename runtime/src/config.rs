//! Engine configuration.
//!
//! Loaded from environment variables with defaults for every value, so an
//! empty environment yields a working engine. [`DispatchConfig::from_lookup`]
//! takes any key lookup, which is how tests supply values.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryPolicy;
use ride_dispatch_core::fare::{FareEstimate, FareTable};
use ride_dispatch_core::types::VehicleCategory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration values that cannot work together.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value outside its allowed range
    #[error("Invalid configuration for {key}: {reason}")]
    Invalid {
        /// Offending setting
        key: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Operation timeouts and commit retries
    pub engine: EngineConfig,
    /// Fare estimation and fallback table
    pub fare: FareConfig,
    /// Live feed behaviour
    pub feed: FeedConfig,
    /// `PostgreSQL` store
    pub postgres: PostgresConfig,
    /// Prometheus exporter
    pub metrics: MetricsConfig,
}

/// Operation timeouts and commit retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound for every engine operation, in milliseconds
    pub operation_timeout_ms: u64,
    /// Read-compute-commit attempts before a conflicting write gives up
    pub settlement_max_attempts: usize,
    /// First delay between conflicting commits, in milliseconds
    pub commit_backoff_initial_ms: u64,
    /// Largest delay between conflicting commits, in milliseconds
    pub commit_backoff_max_ms: u64,
    /// Change events buffered per feed subscriber before it counts as lagging
    pub broadcast_capacity: usize,
}

/// Fare estimation and fallback table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FareConfig {
    /// Flag-fall added to every distance-based fare
    pub base_fare: u32,
    /// Price per kilometre before the category multiplier
    pub per_km: u32,
    /// Category multipliers applied to base and distance price
    pub multipliers: BTreeMap<VehicleCategory, f64>,
    /// Average speed used for ETAs, in km/h
    pub average_speed_kmh: f64,
    /// Fallback amount before the category multiplier
    pub fallback_base: u32,
    /// Fallback ETA in minutes
    pub fallback_eta_minutes: u32,
    /// Remote estimator endpoint; the distance estimator is used when unset
    pub estimator_url: Option<String>,
    /// Time allowed for one estimate, in milliseconds
    pub estimator_timeout_ms: u64,
    /// Consecutive estimator failures that open the circuit
    pub breaker_failure_threshold: usize,
    /// Seconds the circuit stays open
    pub breaker_open_secs: u64,
}

/// Live feed behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Resubscription attempts before a feed ends
    pub reconnect_max_retries: usize,
    /// First resubscription delay, in milliseconds
    pub reconnect_initial_ms: u64,
    /// Largest resubscription delay, in milliseconds
    pub reconnect_max_ms: u64,
    /// Hide requests whose pickup is further than this from the driver
    pub pickup_radius_km: Option<f64>,
}

/// `PostgreSQL` store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Connection URL; the in-memory store is used when unset
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Prometheus exporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to install the exporter
    pub enabled: bool,
    /// Scrape address
    pub addr: SocketAddr,
}

const DEFAULT_MULTIPLIERS: [(VehicleCategory, f64); 6] = [
    (VehicleCategory::Bike, 0.6),
    (VehicleCategory::Auto, 0.8),
    (VehicleCategory::Mini, 1.0),
    (VehicleCategory::Sedan, 1.3),
    (VehicleCategory::Suv, 1.6),
    (VehicleCategory::Pink, 1.1),
];

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

impl DispatchConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Unparseable values fall back to their defaults.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let multipliers = VehicleCategory::ALL
            .into_iter()
            .map(|category| {
                let key = format!("FARE_MULTIPLIER_{}", category.as_str());
                let default = defaults.fare.multiplier(category);
                (category, parsed(&lookup, &key, default))
            })
            .collect();

        Self {
            engine: EngineConfig {
                operation_timeout_ms: parsed(
                    &lookup,
                    "DISPATCH_OPERATION_TIMEOUT_MS",
                    defaults.engine.operation_timeout_ms,
                ),
                settlement_max_attempts: parsed(
                    &lookup,
                    "DISPATCH_SETTLEMENT_MAX_ATTEMPTS",
                    defaults.engine.settlement_max_attempts,
                ),
                commit_backoff_initial_ms: parsed(
                    &lookup,
                    "DISPATCH_COMMIT_BACKOFF_INITIAL_MS",
                    defaults.engine.commit_backoff_initial_ms,
                ),
                commit_backoff_max_ms: parsed(
                    &lookup,
                    "DISPATCH_COMMIT_BACKOFF_MAX_MS",
                    defaults.engine.commit_backoff_max_ms,
                ),
                broadcast_capacity: parsed(
                    &lookup,
                    "DISPATCH_BROADCAST_CAPACITY",
                    defaults.engine.broadcast_capacity,
                ),
            },
            fare: FareConfig {
                base_fare: parsed(&lookup, "FARE_BASE", defaults.fare.base_fare),
                per_km: parsed(&lookup, "FARE_PER_KM", defaults.fare.per_km),
                multipliers,
                average_speed_kmh: parsed(
                    &lookup,
                    "FARE_AVERAGE_SPEED_KMH",
                    defaults.fare.average_speed_kmh,
                ),
                fallback_base: parsed(&lookup, "FARE_FALLBACK_BASE", defaults.fare.fallback_base),
                fallback_eta_minutes: parsed(
                    &lookup,
                    "FARE_FALLBACK_ETA_MINUTES",
                    defaults.fare.fallback_eta_minutes,
                ),
                estimator_url: lookup("FARE_ESTIMATOR_URL").filter(|url| !url.trim().is_empty()),
                estimator_timeout_ms: parsed(
                    &lookup,
                    "FARE_ESTIMATOR_TIMEOUT_MS",
                    defaults.fare.estimator_timeout_ms,
                ),
                breaker_failure_threshold: parsed(
                    &lookup,
                    "FARE_BREAKER_FAILURE_THRESHOLD",
                    defaults.fare.breaker_failure_threshold,
                ),
                breaker_open_secs: parsed(
                    &lookup,
                    "FARE_BREAKER_OPEN_SECS",
                    defaults.fare.breaker_open_secs,
                ),
            },
            feed: FeedConfig {
                reconnect_max_retries: parsed(
                    &lookup,
                    "FEED_RECONNECT_MAX_RETRIES",
                    defaults.feed.reconnect_max_retries,
                ),
                reconnect_initial_ms: parsed(
                    &lookup,
                    "FEED_RECONNECT_INITIAL_MS",
                    defaults.feed.reconnect_initial_ms,
                ),
                reconnect_max_ms: parsed(&lookup, "FEED_RECONNECT_MAX_MS", defaults.feed.reconnect_max_ms),
                pickup_radius_km: lookup("FEED_PICKUP_RADIUS_KM").and_then(|s| s.trim().parse().ok()),
            },
            postgres: PostgresConfig {
                url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
                max_connections: parsed(
                    &lookup,
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.postgres.max_connections,
                ),
            },
            metrics: MetricsConfig {
                enabled: parsed(&lookup, "METRICS_ENABLED", defaults.metrics.enabled),
                addr: parsed(&lookup, "METRICS_ADDR", defaults.metrics.addr),
            },
        }
    }

    /// Check values that parse but cannot work.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key, reason: &str| {
            Err(ConfigError::Invalid {
                key,
                reason: reason.to_string(),
            })
        };

        if self.engine.operation_timeout_ms == 0 {
            return invalid("DISPATCH_OPERATION_TIMEOUT_MS", "must be positive");
        }
        if self.engine.settlement_max_attempts == 0 {
            return invalid("DISPATCH_SETTLEMENT_MAX_ATTEMPTS", "at least one attempt is required");
        }
        if self.engine.broadcast_capacity == 0 {
            return invalid("DISPATCH_BROADCAST_CAPACITY", "must be positive");
        }
        if self.fare.estimator_timeout_ms == 0 {
            return invalid("FARE_ESTIMATOR_TIMEOUT_MS", "must be positive");
        }
        if !(self.fare.average_speed_kmh.is_finite() && self.fare.average_speed_kmh > 0.0) {
            return invalid("FARE_AVERAGE_SPEED_KMH", "must be a positive speed");
        }
        if let Some((category, _)) = self
            .fare
            .multipliers
            .iter()
            .find(|(_, factor)| !(factor.is_finite() && **factor > 0.0))
        {
            return Err(ConfigError::Invalid {
                key: "FARE_MULTIPLIER",
                reason: format!("multiplier for {category} must be positive"),
            });
        }
        if self.feed.pickup_radius_km.is_some_and(|radius| !(radius.is_finite() && radius > 0.0)) {
            return invalid("FEED_PICKUP_RADIUS_KM", "must be a positive distance");
        }
        Ok(())
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig {
                operation_timeout_ms: 10_000,
                settlement_max_attempts: 5,
                commit_backoff_initial_ms: 5,
                commit_backoff_max_ms: 100,
                broadcast_capacity: 1024,
            },
            fare: FareConfig {
                base_fare: 40,
                per_km: 12,
                multipliers: DEFAULT_MULTIPLIERS.into_iter().collect(),
                average_speed_kmh: 24.0,
                fallback_base: 120,
                fallback_eta_minutes: 10,
                estimator_url: None,
                estimator_timeout_ms: 2_000,
                breaker_failure_threshold: 5,
                breaker_open_secs: 30,
            },
            feed: FeedConfig {
                reconnect_max_retries: 10,
                reconnect_initial_ms: 200,
                reconnect_max_ms: 10_000,
                pickup_radius_km: None,
            },
            postgres: PostgresConfig {
                url: None,
                max_connections: 10,
            },
            metrics: MetricsConfig {
                enabled: false,
                addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            },
        }
    }
}

impl EngineConfig {
    /// Upper bound for every engine operation.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Backoff between read-compute-commit attempts after a conflict.
    #[must_use]
    pub fn commit_retry(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.settlement_max_attempts.saturating_sub(1))
            .initial_delay(Duration::from_millis(self.commit_backoff_initial_ms))
            .max_delay(Duration::from_millis(self.commit_backoff_max_ms))
            .build()
    }
}

impl FareConfig {
    /// Multiplier for `category`; 1.0 when unset.
    #[must_use]
    pub fn multiplier(&self, category: VehicleCategory) -> f64 {
        self.multipliers.get(&category).copied().unwrap_or(1.0)
    }

    /// Estimate served when the estimator cannot answer for `category`.
    #[must_use]
    pub fn fallback(&self, category: VehicleCategory) -> FareEstimate {
        FareEstimate {
            amount: scale(self.fallback_base, self.multiplier(category)),
            eta_minutes: self.fallback_eta_minutes,
        }
    }

    /// Fallback estimates for every category.
    #[must_use]
    pub fn fallback_table(&self) -> FareTable {
        VehicleCategory::ALL
            .into_iter()
            .map(|category| (category, self.fallback(category)))
            .collect()
    }

    /// Time allowed for one estimate.
    #[must_use]
    pub const fn estimator_timeout(&self) -> Duration {
        Duration::from_millis(self.estimator_timeout_ms)
    }

    /// Circuit breaker settings for the estimator.
    #[must_use]
    pub fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_threshold(self.breaker_failure_threshold)
            .timeout(Duration::from_secs(self.breaker_open_secs))
            .build()
    }
}

/// `amount * factor`, rounded, never below 1.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // clamped to the u32 range first
pub(crate) fn scale(amount: u32, factor: f64) -> u32 {
    let scaled = (f64::from(amount) * factor).round();
    if scaled.is_nan() {
        return 1;
    }
    scaled.clamp(1.0, f64::from(u32::MAX)) as u32
}

impl FeedConfig {
    /// Resubscription backoff.
    #[must_use]
    pub fn reconnect(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.reconnect_max_retries)
            .initial_delay(Duration::from_millis(self.reconnect_initial_ms))
            .max_delay(Duration::from_millis(self.reconnect_max_ms))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| values.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = DispatchConfig::from_lookup(|_| None);
        assert_eq!(config, DispatchConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.operation_timeout(), Duration::from_secs(10));
        assert_eq!(config.engine.commit_retry().max_attempts(), 5);
    }

    #[test]
    fn values_are_read_and_bad_ones_ignored() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("DISPATCH_OPERATION_TIMEOUT_MS", "2500"),
            ("DISPATCH_SETTLEMENT_MAX_ATTEMPTS", "not-a-number"),
            ("FARE_MULTIPLIER_SUV", "2.0"),
            ("FARE_ESTIMATOR_URL", "http://fares.internal/estimate"),
            ("FEED_PICKUP_RADIUS_KM", "7.5"),
            ("METRICS_ENABLED", "true"),
            ("METRICS_ADDR", "127.0.0.1:9100"),
        ]));

        assert_eq!(config.engine.operation_timeout_ms, 2500);
        assert_eq!(config.engine.settlement_max_attempts, 5);
        assert!((config.fare.multiplier(VehicleCategory::Suv) - 2.0).abs() < f64::EPSILON);
        assert_eq!(
            config.fare.estimator_url.as_deref(),
            Some("http://fares.internal/estimate")
        );
        assert_eq!(config.feed.pickup_radius_km, Some(7.5));
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.addr, SocketAddr::from(([127, 0, 0, 1], 9100)));
    }

    #[test]
    fn fallback_scales_by_category() {
        let fare = DispatchConfig::default().fare;
        assert_eq!(fare.fallback(VehicleCategory::Mini).amount, 120);
        assert_eq!(fare.fallback(VehicleCategory::Bike).amount, 72);
        assert_eq!(fare.fallback(VehicleCategory::Suv).amount, 192);
        assert_eq!(fare.fallback_table().missing().count(), 0);
    }

    #[test]
    fn zero_attempts_fail_validation() {
        let config = DispatchConfig::from_lookup(lookup(&[("DISPATCH_SETTLEMENT_MAX_ATTEMPTS", "0")]));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "DISPATCH_SETTLEMENT_MAX_ATTEMPTS",
                ..
            })
        ));
    }

    #[test]
    fn scale_never_drops_to_zero() {
        assert_eq!(scale(1, 0.1), 1);
        assert_eq!(scale(100, 1.25), 125);
    }
}
