//! Top-level configuration.
//!
//! Groups the per-layer tuning structs so a deployment can describe itself
//! in one JSON document. Every section is optional and falls back to its
//! defaults:
//!
//! ```json
//! {
//!   "service": { "name": "blog", "app_url": "http://localhost/blog/" },
//!   "pool": { "async_max_in_flight": 50 },
//!   "router": { "heartbeat_window_ms": 5000 }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tether_gateway::{GatewayConfig, ServiceConfig};
use tether_replica::{PoolConfig, RouterConfig};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub pool: PoolConfig,
    pub gateway: GatewayConfig,
    pub router: RouterConfig,
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json_str(&json)?;
        debug!(path = %path.display(), service = %config.service.name, "configuration loaded");
        Ok(config)
    }

    /// Tuning from `TETHER_*` environment variables; the service section
    /// keeps its defaults.
    pub fn from_env() -> Self {
        Self {
            service: ServiceConfig::default(),
            pool: PoolConfig::from_env(),
            gateway: GatewayConfig::from_env(),
            router: RouterConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn empty_document_is_all_defaults() {
        assert_eq!(Config::from_json_str("{}").unwrap(), Config::default());
    }

    #[test]
    fn sections_override_independently() {
        let config = Config::from_json_str(
            r#"{
                "service": {"name": "blog", "app_url": "http://localhost/blog/"},
                "pool": {"async_max_in_flight": 50},
                "router": {"heartbeat_window_ms": 5000}
            }"#,
        )
        .unwrap();
        assert_eq!(config.service.name, "blog");
        assert_eq!(config.service.mount_prefix(), "/blog");
        assert_eq!(config.pool.async_max_in_flight, 50);
        assert_eq!(config.pool.sync_max_in_flight, 1);
        assert_eq!(config.router.heartbeat_window(), Duration::from_secs(5));
        assert_eq!(config.gateway, GatewayConfig::default());
    }

    #[test]
    fn loads_from_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"gateway": {{"max_app_count": 8}}}}"#).unwrap();
        let config = Config::from_path(file.path()).unwrap();
        assert_eq!(config.gateway.max_app_count, 8);
    }

    #[test]
    fn reports_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        assert!(matches!(
            Config::from_path(&missing),
            Err(ConfigError::Io { .. })
        ));
        assert!(matches!(
            Config::from_json_str("{\"pool\": 3}"),
            Err(ConfigError::Parse(_))
        ));
    }
}
