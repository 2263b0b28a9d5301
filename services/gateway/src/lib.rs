//! Service gateway
//!
//! Hosts the service registry's HTTP surface and a framed RPC listener
//! whose calls are forwarded to live backend instances according to the
//! route table.

pub mod app;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod results;
pub mod routes;

pub use app::{Gateway, RunningGateway};
pub use config::{ChunkConfig, GatewayConfig, RoutingConfig};
pub use dispatch::GatewayHandler;
pub use error::{GatewayError, Result};
pub use results::{ResultsClient, ResultsContract, ResultsSink, STORE_IMAGE_METHOD};
pub use routes::{Route, RouteMode, RouteTable};
