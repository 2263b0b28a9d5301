//! Registry and registry-client settings

use crate::entry::ServiceDescriptor;
use crate::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default heartbeat interval used by registry clients
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
/// Default expiry window (three missed heartbeats)
pub const DEFAULT_EXPIRY_WINDOW_SECS: u64 = 90;
/// Default sweep interval
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 15;
/// Default timeout for a single registry request
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Gateway-side registry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub expiry_window_secs: u64,
    pub sweep_interval_secs: u64,
    /// Heartbeat interval clients are expected to use
    pub heartbeat_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            expiry_window_secs: DEFAULT_EXPIRY_WINDOW_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
        }
    }
}

impl RegistryConfig {
    pub fn expiry_window(&self) -> Duration {
        Duration::from_secs(self.expiry_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(RegistryError::invalid(
                "heartbeat_interval_secs",
                "must be greater than zero",
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(RegistryError::invalid(
                "sweep_interval_secs",
                "must be greater than zero",
            ));
        }
        if self.expiry_window_secs < 2 * self.heartbeat_interval_secs {
            return Err(RegistryError::invalid(
                "expiry_window_secs",
                format!(
                    "{}s is shorter than two heartbeat intervals ({}s)",
                    self.expiry_window_secs,
                    2 * self.heartbeat_interval_secs
                ),
            ));
        }
        Ok(())
    }
}

/// Settings for the registry client embedded in a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the gateway's HTTP surface
    pub gateway_url: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// How this instance announces itself
    pub service: ServiceDescriptor,
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

impl ClientConfig {
    pub fn new(gateway_url: impl Into<String>, service: ServiceDescriptor) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            service,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.gateway_url)
            .map_err(|e| RegistryError::invalid("gateway_url", e.to_string()))?;
        if self.heartbeat_interval_secs == 0 {
            return Err(RegistryError::invalid(
                "heartbeat_interval_secs",
                "must be greater than zero",
            ));
        }
        self.service.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let config = RegistryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.expiry_window(), Duration::from_secs(90));
    }

    #[test]
    fn test_short_expiry_window_rejected() {
        let config = RegistryConfig {
            expiry_window_secs: 45,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RegistryError::Invalid { ref field, .. }) if field == "expiry_window_secs"
        ));
    }

    #[test]
    fn test_client_config_defaults_from_json() {
        let config: ClientConfig = serde_json::from_str(
            r#"{
                "gateway_url": "http://gateway:8080",
                "service": {
                    "name": "Results",
                    "uniqueName": "results-1",
                    "type": "Results",
                    "url": "tcp://results:7300",
                    "version": "3.0.1"
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }
}
