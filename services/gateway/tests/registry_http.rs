//! Backends registering through the gateway's HTTP surface

use gateway::{Gateway, GatewayConfig, RunningGateway};
use passthrough::TcpConnector;
use registry::{
    ClientConfig, ClientState, ExpirySweeper, HttpRegistryApi, LocalRegistryApi, ManualClock,
    RegistrationService, RegistryApi, RegistryClient, RegistryError, RegistryStore,
    ServiceDescriptor,
};
use std::sync::Arc;
use std::time::Duration;

async fn start_gateway() -> (RunningGateway, Arc<ManualClock>) {
    let config = GatewayConfig {
        rpc_listen: "127.0.0.1:0".to_string(),
        http_listen: "127.0.0.1:0".to_string(),
        ..Default::default()
    };
    let clock = Arc::new(ManualClock::starting_now());
    let connector = Arc::new(TcpConnector::new(config.tcp_config()));
    let gateway = Gateway::assemble(config, connector, clock.clone())
        .unwrap()
        .start()
        .await
        .unwrap();
    (gateway, clock)
}

fn client_for(gateway: &RunningGateway, unique_name: &str) -> RegistryClient {
    let config = ClientConfig::new(
        format!("http://{}", gateway.http_addr()),
        ServiceDescriptor::new(
            "Agents",
            unique_name,
            "Agents",
            "tcp://127.0.0.1:7301",
            "2.0.1",
        ),
    );
    RegistryClient::from_config(&config).unwrap()
}

#[tokio::test]
async fn test_client_registers_and_unregisters_over_http() {
    let (gateway, _) = start_gateway().await;
    let client = client_for(&gateway, "agents-1");

    client.start().await;
    let id = match client.state() {
        ClientState::Registered(id) => id,
        other => panic!("expected registration, got {:?}", other),
    };
    assert_eq!(gateway.store().lookup("agents-1").unwrap().id, id);

    let listed: serde_json::Value = reqwest::get(format!(
        "http://{}/registry/services",
        gateway.http_addr()
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(listed["count"], 1);
    assert_eq!(listed["services"][0]["uniqueName"], "agents-1");
    assert_eq!(listed["services"][0]["version"], "2.0.1");

    client.stop().await;
    assert_eq!(client.state(), ClientState::Unregistered);
    assert!(gateway.store().is_empty());

    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_instance_with_same_name_is_refused() {
    let (gateway, _) = start_gateway().await;
    let first = client_for(&gateway, "agents-1");
    let second = client_for(&gateway, "agents-1");

    first.start().await;
    second.tick().await;

    assert!(matches!(first.state(), ClientState::Registered(_)));
    assert_eq!(second.state(), ClientState::Unregistered);
    assert_eq!(gateway.store().len(), 1);

    first.stop().await;
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expired_client_registers_again_with_new_id() {
    let (gateway, clock) = start_gateway().await;
    let client = client_for(&gateway, "agents-1");

    client.tick().await;
    let first_id = client.service_id().unwrap();

    clock.advance_secs(91);
    ExpirySweeper::new(Arc::clone(gateway.store()), Duration::from_secs(15)).sweep_once();
    assert!(gateway.store().is_empty());

    // heartbeat is refused, so the same tick registers from scratch
    client.tick().await;
    let second_id = client.service_id().unwrap();
    assert_ne!(first_id, second_id);
    assert_eq!(gateway.store().lookup("agents-1").unwrap().id, second_id);

    client.stop().await;
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_health_reports_live_instances() {
    let (gateway, _) = start_gateway().await;
    let client = client_for(&gateway, "agents-1");
    client.tick().await;

    let health: serde_json::Value =
        reqwest::get(format!("http://{}/health", gateway.http_addr()))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["liveInstances"], 1);

    client.stop().await;
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_name_is_a_conflict_over_http_and_in_process() {
    let (gateway, clock) = start_gateway().await;
    let descriptor = ServiceDescriptor::new(
        "Agents",
        "agents-1",
        "Agents",
        "tcp://127.0.0.1:7301",
        "2.0.1",
    );

    let http = HttpRegistryApi::new(
        format!("http://{}", gateway.http_addr()),
        Duration::from_secs(5),
    )
    .unwrap();
    let http_id = http.register(&descriptor).await.unwrap();
    let http_err = http.register(&descriptor).await.unwrap_err();

    let local = LocalRegistryApi::new(RegistrationService::new(Arc::new(
        RegistryStore::with_clock(Duration::from_secs(90), clock),
    )));
    let local_id = local.register(&descriptor).await.unwrap();
    let local_err = local.register(&descriptor).await.unwrap_err();

    assert_eq!(
        http_err,
        RegistryError::Conflict {
            unique_name: "agents-1".to_string(),
            existing: http_id,
        }
    );
    assert_eq!(
        local_err,
        RegistryError::Conflict {
            unique_name: "agents-1".to_string(),
            existing: local_id,
        }
    );
    assert_eq!(http_err.code(), local_err.code());

    http.unregister(http_id).await.unwrap();
    gateway.shutdown().await.unwrap();
}
