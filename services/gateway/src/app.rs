//! Gateway lifecycle
//!
//! Builds the shared registry store, the channel cache and router on top of
//! it, then runs the expiry sweep, the RPC listener and the HTTP registry
//! surface until shutdown. Shutdown cancels every task and closes all
//! backend channels.

use crate::config::GatewayConfig;
use crate::dispatch::GatewayHandler;
use crate::error::{parse_addr, GatewayError, Result};
use crate::routes::RouteTable;
use passthrough::{
    serve, ChannelCache, ClientFactories, Connector, Router, ServerConfig, TcpConnector,
};
use registry::{Clock, ExpirySweeper, RegistrationService, RegistryStore, SystemClock};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Fully wired gateway, not yet listening
pub struct Gateway {
    config: GatewayConfig,
    store: Arc<RegistryStore>,
    registration: RegistrationService,
    cache: Arc<ChannelCache>,
    router: Arc<Router>,
    routes: Arc<RouteTable>,
}

impl Gateway {
    /// Gateway connecting to backends over TCP
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let connector = Arc::new(TcpConnector::new(config.tcp_config()));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: GatewayConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::assemble(config, connector, Arc::new(SystemClock))
    }

    /// Wire every component; `clock` judges registry liveness
    pub fn assemble(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let routes = Arc::new(config.route_table()?);

        let store = Arc::new(RegistryStore::with_clock(
            config.registry.expiry_window(),
            clock,
        ));
        let registration = RegistrationService::new(Arc::clone(&store));

        let factories = Arc::new(ClientFactories::new());
        crate::results::register_contracts(&factories);
        let cache = ChannelCache::new(
            Arc::clone(&store),
            connector,
            factories,
            config.cache_config(),
        );
        let router = Arc::new(Router::new(
            Arc::clone(&cache),
            config.router_config(),
            config.feature_policy(),
        ));

        Ok(Self {
            config,
            store,
            registration,
            cache,
            router,
            routes,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    pub fn registration(&self) -> &RegistrationService {
        &self.registration
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Bind both listeners and start every background task
    pub async fn start(self) -> Result<RunningGateway> {
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let sweeper = ExpirySweeper::new(
            Arc::clone(&self.store),
            self.config.registry.sweep_interval(),
        );
        tasks.push(sweeper.spawn(shutdown.child_token()));

        let rpc_addr = parse_addr(&self.config.rpc_listen)?;
        let listener = TcpListener::bind(rpc_addr)
            .await
            .map_err(|e| GatewayError::bind(rpc_addr, e))?;
        let rpc_addr = listener
            .local_addr()
            .map_err(|e| GatewayError::bind(rpc_addr, e))?;
        let handler = Arc::new(GatewayHandler::new(
            Arc::clone(&self.router),
            Arc::clone(&self.routes),
            self.config.chunks.max_payload_bytes,
        ));
        let rpc_shutdown = shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = serve(listener, handler, ServerConfig::default(), rpc_shutdown).await {
                error!(error = %e, "RPC listener failed");
            }
        }));

        let http_addr = parse_addr(&self.config.http_listen)?;
        let http_shutdown = shutdown.child_token();
        let (http_addr, server) = warp::serve(crate::http::routes(self.registration.clone()))
            .try_bind_with_graceful_shutdown(http_addr, async move {
                http_shutdown.cancelled().await
            })
            .map_err(|e| GatewayError::bind(http_addr, e))?;
        tasks.push(tokio::spawn(server));

        info!(
            rpc = %rpc_addr,
            http = %http_addr,
            routes = self.routes.len(),
            "Gateway started"
        );

        Ok(RunningGateway {
            rpc_addr,
            http_addr,
            store: self.store,
            cache: self.cache,
            shutdown,
            tasks,
        })
    }
}

/// Handle on a started gateway
pub struct RunningGateway {
    rpc_addr: SocketAddr,
    http_addr: SocketAddr,
    store: Arc<RegistryStore>,
    cache: Arc<ChannelCache>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningGateway {
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    /// Stop listening, stop the sweep, and close every backend channel
    pub async fn shutdown(self) -> Result<()> {
        info!("Gateway shutting down");
        self.shutdown.cancel();
        let mut failure = None;
        for task in self.tasks {
            if let Err(e) = task.await {
                failure.get_or_insert(GatewayError::Task(e.to_string()));
            }
        }
        self.cache.close_all();
        info!("Gateway stopped");
        failure.map_or(Ok(()), Err)
    }
}
