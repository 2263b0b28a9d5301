//! Passthrough Error Types
//!
//! [`Status`] is the error a backend puts on the wire. [`PassthroughError`]
//! is what routing surfaces to the gateway's caller; a backend's own status
//! travels back inside [`PassthroughError::Upstream`] untouched.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PassthroughError>;

/// Wire-level status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Unimplemented,
    Unavailable,
    Internal,
    DataLoss,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error carried in an `Error` frame
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn unimplemented(method: &str) -> Self {
        Self::new(
            StatusCode::Unimplemented,
            format!("method '{}' is not implemented", method),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }
}

/// Routing and transport failures
#[derive(Debug, Clone, Error)]
pub enum PassthroughError {
    #[error("No live instance for '{target}'")]
    NotFound { target: String },

    #[error("No live instance of required service type '{service_type}'")]
    Unavailable { service_type: String },

    #[error("Corrupt transfer: {0}")]
    Corrupt(String),

    #[error("Upstream error: {0}")]
    Upstream(Status),

    #[error("Call cancelled")]
    Cancelled,

    #[error("Timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A per-call queue overflowed and the call was dropped
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl PassthroughError {
    pub fn not_found(target: impl Into<String>) -> Self {
        Self::NotFound {
            target: target.into(),
        }
    }

    pub fn unavailable(service_type: impl Into<String>) -> Self {
        Self::Unavailable {
            service_type: service_type.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted(message.into())
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Status to put on the wire for the gateway's own caller
    pub fn to_status(&self) -> Status {
        match self {
            Self::Upstream(status) => status.clone(),
            Self::NotFound { .. } => Status::new(StatusCode::NotFound, self.to_string()),
            Self::Unavailable { .. } => Status::new(StatusCode::Unavailable, self.to_string()),
            Self::Corrupt(_) => Status::new(StatusCode::DataLoss, self.to_string()),
            Self::Cancelled => Status::new(StatusCode::Cancelled, self.to_string()),
            Self::Timeout(_) => Status::new(StatusCode::DeadlineExceeded, self.to_string()),
            Self::Transport(_) => Status::new(StatusCode::Unavailable, self.to_string()),
            Self::Protocol(_) => Status::new(StatusCode::Internal, self.to_string()),
            Self::ResourceExhausted(_) => {
                Status::new(StatusCode::ResourceExhausted, self.to_string())
            }
        }
    }
}

impl From<Status> for PassthroughError {
    fn from(status: Status) -> Self {
        Self::Upstream(status)
    }
}

impl From<std::io::Error> for PassthroughError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<bincode::Error> for PassthroughError {
    fn from(err: bincode::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
