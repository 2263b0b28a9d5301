//! Registration Service
//!
//! Validates register/heartbeat/unregister requests and applies them to the
//! shared [`RegistryStore`]. The `handle_*` methods adapt results into the
//! response bodies of [`crate::protocol`]; failures become `success: false`
//! responses, never transport errors.

use crate::entry::{ServiceDescriptor, ServiceId};
use crate::error::Result;
use crate::protocol::{
    AckResponse, HeartbeatRequest, RegisterRequest, RegisterResponse, UnregisterRequest,
};
use crate::store::RegistryStore;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RegistrationService {
    store: Arc<RegistryStore>,
}

impl RegistrationService {
    pub fn new(store: Arc<RegistryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    /// Admit a new instance, returning its fresh id
    pub fn register(&self, descriptor: ServiceDescriptor) -> Result<ServiceId> {
        let unique_name = descriptor.unique_name.clone();
        match self.store.insert(descriptor) {
            Ok(entry) => Ok(entry.id),
            Err(e) => {
                warn!(unique_name = %unique_name, error = %e, "Registration rejected");
                Err(e)
            }
        }
    }

    /// Keep a live instance from expiring
    pub fn heartbeat(&self, id: &ServiceId) -> Result<()> {
        self.store.touch(id).map(|_| ()).map_err(|e| {
            debug!(service_id = %id, error = %e, "Heartbeat rejected");
            e
        })
    }

    /// Remove an instance; unknown ids fail with `NotFound`
    pub fn unregister(&self, id: &ServiceId) -> Result<()> {
        self.store.remove(id).map(|_| ())
    }

    pub fn handle_register(&self, request: RegisterRequest) -> RegisterResponse {
        match self.register(request) {
            Ok(id) => RegisterResponse::ok(id),
            Err(e) => RegisterResponse::failed(&e),
        }
    }

    pub fn handle_heartbeat(&self, request: HeartbeatRequest) -> AckResponse {
        match self.heartbeat(&request.id) {
            Ok(()) => AckResponse::ok(),
            Err(e) => AckResponse::failed(&e),
        }
    }

    /// Repeated unregister of a removed id is a soft failure
    pub fn handle_unregister(&self, request: UnregisterRequest) -> AckResponse {
        match self.unregister(&request.id) {
            Ok(()) => AckResponse::ok(),
            Err(e) => {
                debug!(service_id = %request.id, "Unregister of unknown service");
                AckResponse::failed(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{ErrorCode, RegistryError};
    use std::time::Duration;

    fn service() -> (RegistrationService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(RegistryStore::with_clock(
            Duration::from_secs(90),
            clock.clone(),
        ));
        (RegistrationService::new(store), clock)
    }

    fn analytics(unique: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(
            "Analytics",
            unique,
            "Analytics",
            "tcp://127.0.0.1:7100",
            "2.1.0",
        )
    }

    #[test]
    fn test_register_heartbeat_unregister() {
        let (service, _) = service();
        let id = service.register(analytics("analytics-1")).unwrap();

        service.heartbeat(&id).unwrap();
        service.unregister(&id).unwrap();

        assert!(service.heartbeat(&id).unwrap_err().is_not_found());
        assert!(service.store().is_empty());
    }

    #[test]
    fn test_reregister_after_unregister() {
        let (service, _) = service();
        let first = service.register(analytics("analytics-1")).unwrap();
        assert!(matches!(
            service.register(analytics("analytics-1")),
            Err(RegistryError::Conflict { .. })
        ));

        service.unregister(&first).unwrap();
        let second = service.register(analytics("analytics-1")).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_expired_heartbeat_then_fresh_registration() {
        let (service, clock) = service();
        let first = service.register(analytics("analytics-1")).unwrap();

        clock.advance_secs(120);
        assert!(service.heartbeat(&first).unwrap_err().is_not_found());

        let second = service.register(analytics("analytics-1")).unwrap();
        assert_ne!(first, second);
        service.heartbeat(&second).unwrap();
    }

    #[test]
    fn test_unregister_twice_is_soft_failure() {
        let (service, _) = service();
        let id = service.register(analytics("analytics-1")).unwrap();

        assert!(service.handle_unregister(UnregisterRequest { id }).success);
        let second = service.handle_unregister(UnregisterRequest { id });
        assert!(!second.success);
        assert_eq!(second.code, Some(ErrorCode::NotFound));
    }

    #[test]
    fn test_invalid_descriptor_response() {
        let (service, _) = service();
        let mut descriptor = analytics("analytics-1");
        descriptor.version = "latest".to_string();

        let resp = service.handle_register(descriptor);
        assert!(!resp.success);
        assert_eq!(resp.code, Some(ErrorCode::Invalid));
        assert!(resp.id.is_none());
    }
}
