//! Passthrough routing for the gateway
//!
//! Calls arriving at the gateway are forwarded to whichever backends the
//! registry currently lists as live. [`ChannelCache`] owns the backend
//! connections, [`Router`] implements the forwarding strategies, and
//! [`Reassembler`] rebuilds chunked uploads before they are stored.
//!
//! Backend traffic uses a small length-delimited protocol ([`wire`]) over
//! TCP; [`server::serve`] is the inbound half of the same protocol.

pub mod cache;
pub mod channel;
pub mod chunks;
pub mod connection;
pub mod contract;
pub mod error;
pub mod message;
pub mod router;
pub mod server;
pub mod tcp;
pub mod test_utils;
pub mod wire;
pub mod writer;

pub use cache::{CacheConfig, ChannelCache, DEFAULT_NOTIFICATION_QUEUE};
pub use channel::ChannelHandle;
pub use chunks::{
    receive_payload, split_payload, Chunk, PayloadMeta, PayloadSink, ReassembledPayload,
    Reassembler, DEFAULT_MAX_PAYLOAD_LEN,
};
pub use connection::{CallSender, Connection, Connector, StreamingCall};
pub use contract::{ClientFactories, Contract, Raw, RawClient};
pub use error::{PassthroughError, Result, Status, StatusCode};
pub use message::{CallKind, CallMetadata, ItemStream, ResponseStream, StreamItem};
pub use router::{
    BroadcastReport, CallContext, FeaturePolicy, InstanceFailure, MergeReport, RelayMode,
    RelaySummary, Router, RouterConfig,
};
pub use server::{serve, serve_connection, Handler, ServerConfig, StatusStream};
pub use tcp::{TcpConfig, TcpConnection, TcpConnector};
pub use wire::{Frame, FrameCodec};
pub use writer::{ChannelSink, OutboundSink, SingleWriter, WriterHandle};
