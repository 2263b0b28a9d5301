//! Registry request/response bodies
//!
//! These are the JSON shapes exchanged between the registry client embedded
//! in every backend and the gateway's HTTP registry surface.

use crate::entry::{ServiceDescriptor, ServiceId};
use crate::error::{ErrorCode, RegistryError};
use serde::{Deserialize, Serialize};

pub type RegisterRequest = ServiceDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ServiceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub id: ServiceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterRequest {
    pub id: ServiceId,
}

/// Shared shape of heartbeat and unregister responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

pub type HeartbeatResponse = AckResponse;
pub type UnregisterResponse = AckResponse;

impl RegisterResponse {
    pub fn ok(id: ServiceId) -> Self {
        Self {
            success: true,
            id: Some(id),
            error_message: None,
            code: None,
        }
    }

    /// A conflict carries the id of the entry holding the name
    pub fn failed(err: &RegistryError) -> Self {
        let id = match err {
            RegistryError::Conflict { existing, .. } => Some(*existing),
            _ => None,
        };
        Self {
            success: false,
            id,
            error_message: Some(err.to_string()),
            code: Some(err.code()),
        }
    }

    /// Back into a typed result on the client side, for the name that was
    /// registered
    pub fn into_result(self, unique_name: &str) -> Result<ServiceId, RegistryError> {
        match (self.success, self.code, self.id) {
            (true, _, Some(id)) => Ok(id),
            (true, _, None) => Err(RegistryError::Rejected(
                "registration succeeded without an id".to_string(),
            )),
            (false, Some(ErrorCode::Conflict), Some(existing)) => Err(RegistryError::Conflict {
                unique_name: unique_name.to_string(),
                existing,
            }),
            (false, code, _) => Err(failure(code, self.error_message)),
        }
    }
}

impl AckResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_message: None,
            code: None,
        }
    }

    pub fn failed(err: &RegistryError) -> Self {
        Self {
            success: false,
            error_message: Some(err.to_string()),
            code: Some(err.code()),
        }
    }

    pub fn into_result(self, id: ServiceId) -> Result<(), RegistryError> {
        if self.success {
            return Ok(());
        }
        match self.code {
            Some(ErrorCode::NotFound) => Err(RegistryError::not_found(id)),
            code => Err(failure(code, self.error_message)),
        }
    }
}

fn failure(code: Option<ErrorCode>, message: Option<String>) -> RegistryError {
    let message = message.unwrap_or_else(|| "no error message".to_string());
    match code {
        Some(ErrorCode::NotFound) => RegistryError::NotFound { id: message },
        Some(ErrorCode::Invalid) => RegistryError::Invalid {
            field: "request".to_string(),
            message,
        },
        _ => RegistryError::Rejected(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_response_json_shape() {
        let id = ServiceId::new();
        let json = serde_json::to_value(RegisterResponse::ok(id)).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["id"], id.to_string());
        assert!(json.get("errorMessage").is_none());
    }

    #[test]
    fn test_ack_not_found_maps_back() {
        let id = ServiceId::new();
        let resp = AckResponse::failed(&RegistryError::not_found(id));
        assert_eq!(resp.code, Some(ErrorCode::NotFound));
        assert!(resp.into_result(id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_conflict_survives_the_wire() {
        let existing = ServiceId::new();
        let err = RegistryError::Conflict {
            unique_name: "audit-1".to_string(),
            existing,
        };
        let json = serde_json::to_string(&RegisterResponse::failed(&err)).unwrap();
        let resp: RegisterResponse = serde_json::from_str(&json).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.into_result("audit-1").unwrap_err(), err);
    }

    #[test]
    fn test_conflict_without_id_falls_back_to_rejected() {
        let resp = RegisterResponse {
            success: false,
            id: None,
            error_message: Some("taken".to_string()),
            code: Some(ErrorCode::Conflict),
        };
        assert!(matches!(
            resp.into_result("audit-1").unwrap_err(),
            RegistryError::Rejected(msg) if msg == "taken"
        ));
    }
}
