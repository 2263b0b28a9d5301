//! Registry HTTP surface
//!
//! JSON endpoints used by the registry client embedded in every backend,
//! plus operator views of the live registry.

use registry::{
    HeartbeatRequest, RegisterRequest, RegistrationService, ServiceEntry, UnregisterRequest,
};
use serde::Serialize;
use std::convert::Infallible;
use warp::Filter;

/// Largest accepted registry request body
const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub live_instances: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicesResponse {
    pub count: usize,
    pub services: Vec<ServiceEntry>,
}

fn with_service(
    service: RegistrationService,
) -> impl Filter<Extract = (RegistrationService,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

fn json_body<T>() -> impl Filter<Extract = (T,), Error = warp::Rejection> + Clone
where
    T: serde::de::DeserializeOwned + Send,
{
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

/// All registry routes
pub fn routes(
    service: RegistrationService,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let register = warp::path!("registry" / "register")
        .and(warp::post())
        .and(json_body::<RegisterRequest>())
        .and(with_service(service.clone()))
        .map(|request: RegisterRequest, service: RegistrationService| {
            warp::reply::json(&service.handle_register(request))
        });

    let heartbeat = warp::path!("registry" / "heartbeat")
        .and(warp::post())
        .and(json_body::<HeartbeatRequest>())
        .and(with_service(service.clone()))
        .map(|request: HeartbeatRequest, service: RegistrationService| {
            warp::reply::json(&service.handle_heartbeat(request))
        });

    let unregister = warp::path!("registry" / "unregister")
        .and(warp::post())
        .and(json_body::<UnregisterRequest>())
        .and(with_service(service.clone()))
        .map(|request: UnregisterRequest, service: RegistrationService| {
            warp::reply::json(&service.handle_unregister(request))
        });

    let services = warp::path!("registry" / "services")
        .and(warp::get())
        .and(with_service(service.clone()))
        .map(|service: RegistrationService| {
            let mut services = service.store().live_entries();
            services.sort_by(|a, b| a.unique_name.cmp(&b.unique_name));
            warp::reply::json(&ServicesResponse {
                count: services.len(),
                services,
            })
        });

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_service(service))
        .map(|service: RegistrationService| {
            warp::reply::json(&HealthResponse {
                status: "ok",
                version: env!("CARGO_PKG_VERSION"),
                live_instances: service.store().len(),
            })
        });

    register
        .or(heartbeat)
        .unify()
        .or(unregister)
        .unify()
        .or(services)
        .unify()
        .or(health)
        .unify()
        .with(warp::trace::request())
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry::{ManualClock, RegisterResponse, RegistryStore, ServiceDescriptor};
    use std::sync::Arc;
    use std::time::Duration;

    fn service() -> (RegistrationService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(RegistryStore::with_clock(
            Duration::from_secs(90),
            clock.clone(),
        ));
        (RegistrationService::new(store), clock)
    }

    fn audit_descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new("Audit", "audit-1", "Audit", "tcp://10.0.0.9:7200", "1.4.0")
    }

    #[tokio::test]
    async fn test_register_then_list() {
        let (service, _) = service();
        let api = routes(service);

        let response = warp::test::request()
            .method("POST")
            .path("/registry/register")
            .json(&audit_descriptor())
            .reply(&api)
            .await;
        assert_eq!(response.status(), 200);
        let registered: RegisterResponse = serde_json::from_slice(response.body()).unwrap();
        assert!(registered.success);

        let response = warp::test::request()
            .method("GET")
            .path("/registry/services")
            .reply(&api)
            .await;
        let listed: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(listed["count"], 1);
        assert_eq!(listed["services"][0]["uniqueName"], "audit-1");
        assert_eq!(listed["services"][0]["type"], "Audit");
    }

    #[tokio::test]
    async fn test_duplicate_register_is_soft_failure() {
        let (service, _) = service();
        let api = routes(service);

        for expected in [true, false] {
            let response = warp::test::request()
                .method("POST")
                .path("/registry/register")
                .json(&audit_descriptor())
                .reply(&api)
                .await;
            assert_eq!(response.status(), 200);
            let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
            assert_eq!(body["success"], expected);
            if !expected {
                assert_eq!(body["code"], serde_json::json!("Conflict"));
            }
        }
    }

    #[tokio::test]
    async fn test_heartbeat_after_expiry_reports_not_found() {
        let (service, clock) = service();
        let id = service.register(audit_descriptor()).unwrap();
        let api = routes(service);
        clock.advance_secs(91);

        let response = warp::test::request()
            .method("POST")
            .path("/registry/heartbeat")
            .json(&HeartbeatRequest { id })
            .reply(&api)
            .await;
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], serde_json::json!("NotFound"));
    }

    #[tokio::test]
    async fn test_health_counts_live_instances() {
        let (service, _) = service();
        service.register(audit_descriptor()).unwrap();
        let api = routes(service);

        let response = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&api)
            .await;
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["liveInstances"], 1);
    }

    #[tokio::test]
    async fn test_malformed_body_rejected() {
        let (service, _) = service();
        let api = routes(service);

        let response = warp::test::request()
            .method("POST")
            .path("/registry/register")
            .header("content-type", "application/json")
            .body("{\"name\": 1}")
            .reply(&api)
            .await;
        assert_eq!(response.status(), 400);
    }
}
