//! Gateway and service configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::Value;
use url::Url;

use crate::error::{GatewayError, Result};
use crate::headers::default_server_header;

/// Configuration for one gateway instance inside a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Max concurrent application instances under the asynchronous convention
    pub max_app_count: usize,
    /// How often the instance sweeper runs, in milliseconds
    pub sweep_interval_ms: u64,
    /// Value of the `server` response header (default: `Tether/<version>`)
    pub server_name: Option<String>,
    /// Deadline for a synchronous application call in milliseconds (0 = no timeout)
    pub sync_request_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_app_count: 1000,
            sweep_interval_ms: 100,
            server_name: None,
            sync_request_timeout_ms: 0,
        }
    }
}

impl GatewayConfig {
    /// Create config from environment variables
    ///
    /// Environment variables:
    /// - TETHER_MAX_APP_COUNT: Max asynchronous application instances
    /// - TETHER_SWEEP_INTERVAL_MS: Instance sweep period in ms
    /// - TETHER_SERVER_NAME: `server` header value
    /// - TETHER_SYNC_TIMEOUT_MS: Synchronous call deadline in ms (0 = none)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_app_count: env_parse("TETHER_MAX_APP_COUNT").unwrap_or(defaults.max_app_count),
            sweep_interval_ms: env_parse("TETHER_SWEEP_INTERVAL_MS")
                .unwrap_or(defaults.sweep_interval_ms),
            server_name: std::env::var("TETHER_SERVER_NAME").ok(),
            sync_request_timeout_ms: env_parse("TETHER_SYNC_TIMEOUT_MS")
                .unwrap_or(defaults.sync_request_timeout_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn sync_request_timeout(&self) -> Option<Duration> {
        (self.sync_request_timeout_ms > 0).then(|| Duration::from_millis(self.sync_request_timeout_ms))
    }

    pub fn server_header(&self) -> String {
        self.server_name
            .clone()
            .unwrap_or_else(default_server_header)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// The bootstrap parameters a replica hands to its application loader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Logical service name used for routing
    pub name: String,
    /// Directory holding the application project
    pub project_root: String,
    /// `module:attribute` style locator of the application object
    pub app_spec: String,
    /// Public URL the application is mounted at
    pub app_url: String,
    pub server_url: String,
    pub static_url: String,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, app_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            app_url: app_url.into(),
            ..Default::default()
        }
    }

    /// The path prefix requests are mounted under, without a trailing `/`.
    ///
    /// An empty or unparsable `app_url` mounts at the root.
    pub fn mount_prefix(&self) -> String {
        if self.app_url.is_empty() {
            return String::new();
        }
        match Url::parse(&self.app_url) {
            Ok(url) => url.path().trim_end_matches('/').to_string(),
            Err(_) => self.app_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = std::collections::BTreeMap::new();
        for (key, value) in [
            ("name", &self.name),
            ("project_root", &self.project_root),
            ("app_spec", &self.app_spec),
            ("app_url", &self.app_url),
            ("server_url", &self.server_url),
            ("static_url", &self.static_url),
        ] {
            map.insert(key.to_string(), Value::from(value.as_str()));
        }
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value.as_map().ok_or_else(|| GatewayError::InvalidRequest {
            message: format!("service config must be a map, found {}", value.kind()),
        })?;
        let text = |key: &str| {
            map.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Ok(Self {
            name: text("name"),
            project_root: text("project_root"),
            app_spec: text("app_spec"),
            app_url: text("app_url"),
            server_url: text("server_url"),
            static_url: text("static_url"),
        })
    }
}
