//! Registry Client
//!
//! Embedded in every backend process. Registers the instance at startup,
//! heartbeats on a fixed interval, re-registers from scratch whenever the
//! gateway no longer recognises the held id, and unregisters on shutdown.
//!
//! No failure in here ever reaches the host process: every registry error is
//! logged at `warn` and the loop carries on.
//!
//! ```text
//! Unregistered -> Registering -> Registered -> Unregistering -> Unregistered
//!       ^              |              |
//!       +--- failed ---+-- NotFound --+
//! ```

use crate::config::ClientConfig;
use crate::entry::{ServiceDescriptor, ServiceId};
use crate::error::Result;
use crate::protocol::{AckResponse, HeartbeatRequest, RegisterResponse, UnregisterRequest};
use crate::service::RegistrationService;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Calls a backend makes against the registry
#[async_trait]
pub trait RegistryApi: Send + Sync + Debug {
    async fn register(&self, descriptor: &ServiceDescriptor) -> Result<ServiceId>;

    async fn heartbeat(&self, id: ServiceId) -> Result<()>;

    async fn unregister(&self, id: ServiceId) -> Result<()>;
}

/// Registry API over the gateway's HTTP surface
#[derive(Debug, Clone)]
pub struct HttpRegistryApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRegistryApi {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/registry/{}", self.base_url, path)
    }
}

#[async_trait]
impl RegistryApi for HttpRegistryApi {
    async fn register(&self, descriptor: &ServiceDescriptor) -> Result<ServiceId> {
        let response: RegisterResponse = self
            .client
            .post(self.endpoint("register"))
            .json(descriptor)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response.into_result(&descriptor.unique_name)
    }

    async fn heartbeat(&self, id: ServiceId) -> Result<()> {
        let response: AckResponse = self
            .client
            .post(self.endpoint("heartbeat"))
            .json(&HeartbeatRequest { id })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response.into_result(id)
    }

    async fn unregister(&self, id: ServiceId) -> Result<()> {
        let response: AckResponse = self
            .client
            .post(self.endpoint("unregister"))
            .json(&UnregisterRequest { id })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response.into_result(id)
    }
}

/// Registry API for an instance living in the gateway's own process
#[derive(Debug, Clone)]
pub struct LocalRegistryApi {
    service: RegistrationService,
}

impl LocalRegistryApi {
    pub fn new(service: RegistrationService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl RegistryApi for LocalRegistryApi {
    async fn register(&self, descriptor: &ServiceDescriptor) -> Result<ServiceId> {
        self.service.register(descriptor.clone())
    }

    async fn heartbeat(&self, id: ServiceId) -> Result<()> {
        self.service.heartbeat(&id)
    }

    async fn unregister(&self, id: ServiceId) -> Result<()> {
        self.service.unregister(&id)
    }
}

/// Where the client is in its registration lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unregistered,
    Registering,
    Registered(ServiceId),
    Unregistering,
}

#[derive(Debug)]
struct ClientInner {
    api: Arc<dyn RegistryApi>,
    descriptor: ServiceDescriptor,
    state: Mutex<ClientState>,
}

impl ClientInner {
    fn set_state(&self, state: ClientState) {
        *self.state.lock() = state;
    }

    fn held_id(&self) -> Option<ServiceId> {
        match *self.state.lock() {
            ClientState::Registered(id) => Some(id),
            _ => None,
        }
    }

    async fn try_register(&self) -> bool {
        self.set_state(ClientState::Registering);
        match self.api.register(&self.descriptor).await {
            Ok(id) => {
                self.set_state(ClientState::Registered(id));
                info!(
                    service_id = %id,
                    unique_name = %self.descriptor.unique_name,
                    "Registered with gateway"
                );
                true
            }
            Err(e) => {
                self.set_state(ClientState::Unregistered);
                warn!(
                    unique_name = %self.descriptor.unique_name,
                    error = %e,
                    "Registration failed, will retry on next heartbeat"
                );
                false
            }
        }
    }

    async fn tick(&self) {
        let Some(id) = self.held_id() else {
            self.try_register().await;
            return;
        };

        match self.api.heartbeat(id).await {
            Ok(()) => debug!(service_id = %id, "Heartbeat sent"),
            Err(e) if e.is_not_found() => {
                warn!(
                    service_id = %id,
                    unique_name = %self.descriptor.unique_name,
                    "Gateway no longer knows this instance, re-registering"
                );
                self.set_state(ClientState::Unregistered);
                self.try_register().await;
            }
            Err(e) => {
                warn!(service_id = %id, error = %e, "Heartbeat failed");
            }
        }
    }
}

/// Background registration and heartbeat loop for one backend instance
#[derive(Debug)]
pub struct RegistryClient {
    inner: Arc<ClientInner>,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RegistryClient {
    pub fn new(
        api: Arc<dyn RegistryApi>,
        descriptor: ServiceDescriptor,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                api,
                descriptor,
                state: Mutex::new(ClientState::Unregistered),
            }),
            heartbeat_interval,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Client talking HTTP to the gateway named in `config`
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let api = HttpRegistryApi::new(config.gateway_url.clone(), config.request_timeout())?;
        Ok(Self::new(
            Arc::new(api),
            config.service.clone(),
            config.heartbeat_interval(),
        ))
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.lock()
    }

    pub fn service_id(&self) -> Option<ServiceId> {
        self.inner.held_id()
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.inner.descriptor
    }

    /// Register once, then keep heartbeating in the background
    ///
    /// A failed first registration is only logged; the loop retries.
    pub async fn start(&self) {
        if self.task.lock().is_some() {
            return;
        }

        self.inner.try_register().await;

        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown.clone();
        let interval = self.heartbeat_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = inner.tick() => {}
                        }
                    }
                }
            }
            debug!(unique_name = %inner.descriptor.unique_name, "Heartbeat loop stopped");
        });

        *self.task.lock() = Some(handle);
    }

    /// Run one heartbeat-or-register step immediately
    pub async fn tick(&self) {
        self.inner.tick().await;
    }

    /// Stop heartbeating and unregister, best effort
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Heartbeat loop ended abnormally");
            }
        }

        let Some(id) = self.inner.held_id() else {
            self.inner.set_state(ClientState::Unregistered);
            return;
        };

        self.inner.set_state(ClientState::Unregistering);
        match self.inner.api.unregister(id).await {
            Ok(()) => info!(service_id = %id, "Unregistered from gateway"),
            Err(e) => warn!(service_id = %id, error = %e, "Unregister failed"),
        }
        self.inner.set_state(ClientState::Unregistered);
    }
}

impl Drop for RegistryClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
