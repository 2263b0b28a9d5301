//! Gateway configuration
//!
//! Loaded from an optional TOML file, then overridden by `GATEWAY_*`
//! environment variables (`__` separates nested keys, e.g.
//! `GATEWAY_ROUTING__CALL_TIMEOUT_MS`). Every field has a default.

use crate::error::{GatewayError, Result};
use crate::routes::{Route, RouteTable};
use config_crate::{Config, Environment, File};
use passthrough::{CacheConfig, FeaturePolicy, RouterConfig, TcpConfig, DEFAULT_MAX_PAYLOAD_LEN};
use registry::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Framed RPC listener for passthrough calls
    pub rpc_listen: String,
    /// HTTP listener for the registry surface
    pub http_listen: String,
    pub registry: RegistryConfig,
    pub routing: RoutingConfig,
    pub chunks: ChunkConfig,
    /// Routes added to (or replacing) the defaults
    pub routes: Vec<Route>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rpc_listen: "0.0.0.0:7100".to_string(),
            http_listen: "0.0.0.0:8080".to_string(),
            registry: RegistryConfig::default(),
            routing: RoutingConfig::default(),
            chunks: ChunkConfig::default(),
            routes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub max_fanout_concurrency: usize,
    pub call_timeout_ms: u64,
    pub stream_timeout_secs: u64,
    pub connect_timeout_ms: u64,
    pub notification_queue: usize,
    pub merge_buffer: usize,
    /// Features that fail with `Unavailable` when no instance is live
    pub required_features: Vec<String>,
    /// Also fail required features when every attempted instance failed
    pub require_delivery: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_fanout_concurrency: passthrough::router::DEFAULT_MAX_FANOUT_CONCURRENCY,
            call_timeout_ms: 30_000,
            stream_timeout_secs: 3_600,
            connect_timeout_ms: 5_000,
            notification_queue: passthrough::DEFAULT_NOTIFICATION_QUEUE,
            merge_buffer: 64,
            required_features: vec!["audit".to_string()],
            require_delivery: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub max_payload_bytes: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

impl GatewayConfig {
    /// Load from `path` (if any) with `GATEWAY_*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading gateway configuration");
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("GATEWAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        crate::error::parse_addr(&self.rpc_listen)?;
        crate::error::parse_addr(&self.http_listen)?;
        if self.routing.max_fanout_concurrency == 0 {
            return Err(GatewayError::config(
                "routing.max_fanout_concurrency must be greater than zero",
            ));
        }
        if self.routing.call_timeout_ms == 0 || self.routing.stream_timeout_secs == 0 {
            return Err(GatewayError::config("routing timeouts must be greater than zero"));
        }
        if self.chunks.max_payload_bytes == 0 {
            return Err(GatewayError::config(
                "chunks.max_payload_bytes must be greater than zero",
            ));
        }
        self.route_table().map(|_| ())
    }

    /// Default routes plus the configured ones
    pub fn route_table(&self) -> Result<RouteTable> {
        let mut table = RouteTable::with_defaults();
        table.extend(self.routes.iter().cloned())?;
        Ok(table)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_fanout_concurrency: self.routing.max_fanout_concurrency,
            call_timeout: Duration::from_millis(self.routing.call_timeout_ms),
            stream_timeout: Duration::from_secs(self.routing.stream_timeout_secs),
            merge_buffer: self.routing.merge_buffer,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            notification_queue: self.routing.notification_queue,
            connect_timeout: Duration::from_millis(self.routing.connect_timeout_ms),
        }
    }

    pub fn tcp_config(&self) -> TcpConfig {
        TcpConfig {
            connect_timeout: Duration::from_millis(self.routing.connect_timeout_ms),
            ..TcpConfig::default()
        }
    }

    pub fn feature_policy(&self) -> FeaturePolicy {
        FeaturePolicy::new(&self.routing.required_features)
            .with_require_delivery(self.routing.require_delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::RouteMode;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.feature_policy().is_required("Audit"));
        assert_eq!(config.router_config().call_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_load_file_with_partial_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        fs::write(
            &path,
            r#"
rpc_listen = "127.0.0.1:9100"

[registry]
expiry_window_secs = 120

[routing]
required_features = ["audit", "results"]
require_delivery = true

[[routes]]
method = "Reports/Publish"
service_type = "Reports"
mode = "broadcast"
"#,
        )
        .unwrap();

        let config = GatewayConfig::load(Some(&path)).unwrap();
        assert_eq!(config.rpc_listen, "127.0.0.1:9100");
        assert_eq!(config.http_listen, "0.0.0.0:8080");
        assert_eq!(config.registry.expiry_window_secs, 120);
        assert_eq!(config.registry.sweep_interval_secs, 15);

        let policy = config.feature_policy();
        assert!(policy.is_required("results"));
        assert!(policy.require_delivery());

        let table = config.route_table().unwrap();
        assert_eq!(
            table.get("Reports/Publish").unwrap().mode,
            RouteMode::Broadcast
        );
        assert!(table.get("Audit/AddEntry").is_some());
    }

    #[test]
    fn test_expiry_shorter_than_two_heartbeats_rejected() {
        let mut config = GatewayConfig::default();
        config.registry.expiry_window_secs = 50;
        assert!(matches!(config.validate(), Err(GatewayError::Registry(_))));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = GatewayConfig::default();
        config.routing.max_fanout_concurrency = 0;
        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_bad_listen_address_rejected() {
        let config = GatewayConfig {
            http_listen: "localhost".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(GatewayError::Address(_))));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(GatewayConfig::load(Some(&missing)).is_err());
    }
}
