//! Gateway error types

use registry::RegistryError;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot listen on {addr}: {message}")]
    Bind { addr: String, message: String },

    #[error("Invalid listen address '{0}'")]
    Address(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Task failed: {0}")]
    Task(String),
}

impl GatewayError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn bind(addr: impl ToString, message: impl ToString) -> Self {
        Self::Bind {
            addr: addr.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<config_crate::ConfigError> for GatewayError {
    fn from(err: config_crate::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Parse a `host:port` listen address
pub fn parse_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|_| GatewayError::Address(addr.to_string()))
}
