#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::collections::BTreeMap;
use std::time::Duration;

use bon::Builder;
use url::Url;

use super::params::ParamValue;
use crate::Result;
use crate::error::Error;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_INITIAL_DELAY_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
const DEFAULT_MAX_ATTEMPTS_PER_ENDPOINT: u32 = 5;
const DEFAULT_MAX_ENDPOINT_CYCLES: u32 = 1;

/// Configuration for a [`ConnectionManager`](super::ConnectionManager).
///
/// ```
/// use resilient_ws::ws::config::Config;
///
/// let config = Config::builder()
///     .endpoints(vec![
///         "wss://primary.example.com/stream".to_owned(),
///         "wss://backup.example.com/stream".to_owned(),
///     ])
///     .build();
/// assert_eq!(config.endpoints.len(), 2);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Candidate base addresses, tried in order during failover
    pub endpoints: Vec<String>,
    /// Initial query parameter overlay applied to every endpoint
    #[builder(default)]
    pub params: BTreeMap<String, ParamValue>,
    /// Interval between keep-alive frames while connected
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    pub heartbeat_interval: Duration,
    /// Reconnection and failover policy
    #[builder(default)]
    pub reconnect: ReconnectConfig,
}

impl Config {
    /// Check invariants and parse the endpoint list.
    pub fn validate(&self) -> Result<Vec<Url>> {
        if self.endpoints.is_empty() {
            return Err(Error::validation("at least one endpoint is required"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::validation("heartbeat_interval must be non-zero"));
        }
        self.reconnect.validate()?;

        self.endpoints
            .iter()
            .map(|endpoint| Ok(Url::parse(endpoint)?))
            .collect()
    }
}

/// Configuration for automatic reconnection and endpoint failover.
///
/// ```
/// use std::time::Duration;
///
/// use resilient_ws::ws::config::ReconnectConfig;
///
/// let policy = ReconnectConfig::builder()
///     .initial_delay(Duration::from_millis(250))
///     .max_attempts_per_endpoint(3)
///     .build();
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt on an endpoint
    #[builder(default = DEFAULT_INITIAL_DELAY_DURATION)]
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    #[builder(default = DEFAULT_MAX_DELAY_DURATION)]
    pub max_delay: Duration,
    /// Multiplier applied per attempt, must be greater than one
    #[builder(default = DEFAULT_BACKOFF_FACTOR)]
    pub backoff_factor: f64,
    /// Failed opens on one endpoint before failing over to the next. All but the last are
    /// retried with backoff.
    #[builder(default = DEFAULT_MAX_ATTEMPTS_PER_ENDPOINT)]
    pub max_attempts_per_endpoint: u32,
    /// Full passes through the endpoint list before giving up. Zero disables failover.
    #[builder(default = DEFAULT_MAX_ENDPOINT_CYCLES)]
    pub max_endpoint_cycles: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ReconnectConfig {
    fn validate(&self) -> Result<()> {
        if !self.backoff_factor.is_finite() || self.backoff_factor <= 1.0 {
            return Err(Error::validation(format!(
                "backoff_factor must be greater than 1, got {}",
                self.backoff_factor
            )));
        }
        if self.max_attempts_per_endpoint == 0 {
            return Err(Error::validation(
                "max_attempts_per_endpoint must be at least 1",
            ));
        }
        Ok(())
    }

    /// Delay before reconnection attempt `attempt` (1-based) on the same endpoint:
    /// `min(max_delay, initial_delay * backoff_factor^(attempt - 1))`.
    #[must_use]
    #[expect(
        clippy::float_arithmetic,
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "Backoff is defined over a real-valued factor; the result is clamped to max_delay"
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_nanos() as f64 * self.backoff_factor.powi(exponent);

        if !scaled.is_finite() || scaled >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }

        Duration::from_nanos(scaled.round() as u64).min(self.max_delay)
    }
}
