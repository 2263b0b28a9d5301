//! Registry error types

use crate::entry::ServiceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A live entry already holds this unique name
    #[error("Service '{unique_name}' is already registered as {existing}")]
    Conflict {
        unique_name: String,
        existing: ServiceId,
    },

    /// No live entry for the given id
    #[error("Service {id} not found")]
    NotFound { id: String },

    /// Descriptor failed validation
    #[error("Invalid registration: {field}: {message}")]
    Invalid { field: String, message: String },

    /// The registry could not be reached (client side only)
    #[error("Registry transport error: {0}")]
    Transport(String),

    /// The registry answered with a failure the client does not classify
    #[error("Registry rejected request: {0}")]
    Rejected(String),
}

impl RegistryError {
    pub fn not_found(id: impl ToString) -> Self {
        Self::NotFound { id: id.to_string() }
    }

    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Wire code reported alongside failed responses
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::Conflict { .. } => ErrorCode::Conflict,
            RegistryError::NotFound { .. } => ErrorCode::NotFound,
            RegistryError::Invalid { .. } => ErrorCode::Invalid,
            RegistryError::Transport(_) | RegistryError::Rejected(_) => ErrorCode::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }
}

/// Error classification carried in registry responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Conflict,
    NotFound,
    Invalid,
    Internal,
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        RegistryError::Transport(err.to_string())
    }
}
