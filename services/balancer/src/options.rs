//! Per-route options.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tcplb_upstream::{millis, HealthCheckConfig};

/// Default connect timeout to the selected upstream.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum concurrent connections per route.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Options recognized by `add_route`. Every field has a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteOptions {
    /// Health checking of the route's pool.
    pub health: HealthCheckConfig,
    /// Bound on connecting to the selected upstream.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// Ends a relay direction that carries no data for this long.
    #[serde(rename = "idle_timeout_ms", with = "millis::option")]
    pub idle_timeout: Option<Duration>,
    /// Connections beyond this are closed on accept.
    pub max_connections: usize,
    /// Bound on waiting for relays during close. `None` waits forever.
    #[serde(rename = "drain_timeout_ms", with = "millis::option")]
    pub drain_timeout: Option<Duration>,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            health: HealthCheckConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            drain_timeout: None,
        }
    }
}

impl RouteOptions {
    /// Check option values, returning the reason they are rejected.
    pub fn validate(&self) -> Result<(), String> {
        if self.health.interval.is_zero() {
            return Err("health check interval must be positive".to_string());
        }
        if self.health.timeout.is_zero() {
            return Err("health check timeout must be positive".to_string());
        }
        if self.health.failure_threshold == 0 {
            return Err("failure threshold must be at least 1".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("connect timeout must be positive".to_string());
        }
        if self.max_connections == 0 || self.max_connections > u32::MAX as usize {
            return Err(format!(
                "max connections must be between 1 and {}",
                u32::MAX
            ));
        }
        Ok(())
    }
}
