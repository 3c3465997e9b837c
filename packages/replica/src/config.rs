//! Pool and router tuning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Admission caps for the replica pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// In-flight exchanges per replica under the synchronous convention
    pub sync_max_in_flight: usize,
    /// In-flight exchanges per replica under the asynchronous convention
    pub async_max_in_flight: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            sync_max_in_flight: 1,
            async_max_in_flight: 100,
        }
    }
}

impl PoolConfig {
    /// Create config from environment variables
    ///
    /// Environment variables:
    /// - TETHER_SYNC_MAX_IN_FLIGHT: Synchronous admission cap
    /// - TETHER_ASYNC_MAX_IN_FLIGHT: Asynchronous admission cap
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sync_max_in_flight: env_parse("TETHER_SYNC_MAX_IN_FLIGHT")
                .unwrap_or(defaults.sync_max_in_flight),
            async_max_in_flight: env_parse("TETHER_ASYNC_MAX_IN_FLIGHT")
                .unwrap_or(defaults.async_max_in_flight),
        }
    }
}

/// Heartbeat timing shared by the router and announcing hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// How long a registration stays live after its last heartbeat, in ms
    pub heartbeat_window_ms: u64,
    /// How often an announced host pings, in ms
    pub heartbeat_period_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            heartbeat_window_ms: 10_000,
            heartbeat_period_ms: 1_000,
        }
    }
}

impl RouterConfig {
    /// Create config from environment variables
    ///
    /// Environment variables:
    /// - TETHER_HEARTBEAT_WINDOW_MS: Liveness window in ms
    /// - TETHER_HEARTBEAT_PERIOD_MS: Ping period in ms
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            heartbeat_window_ms: env_parse("TETHER_HEARTBEAT_WINDOW_MS")
                .unwrap_or(defaults.heartbeat_window_ms),
            heartbeat_period_ms: env_parse("TETHER_HEARTBEAT_PERIOD_MS")
                .unwrap_or(defaults.heartbeat_period_ms),
        }
    }

    pub fn heartbeat_window(&self) -> Duration {
        Duration::from_millis(self.heartbeat_window_ms)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms.max(1))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
