//! Backend connection abstraction
//!
//! A [`Connection`] is one reusable link to one backend instance, able to
//! carry any number of concurrent calls. A [`Connector`] opens connections
//! for registry entries; the channel cache is its only caller.

use crate::error::{PassthroughError, Result};
use crate::message::{CallKind, CallMetadata, ResponseStream, StreamItem};
use async_trait::async_trait;
use bytes::Bytes;
use registry::ServiceEntry;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Request side of an open client-streaming or duplex call
///
/// Dropping the sender half-closes the call.
#[derive(Debug, Clone)]
pub struct CallSender {
    tx: mpsc::Sender<StreamItem>,
}

impl CallSender {
    pub fn new(tx: mpsc::Sender<StreamItem>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, item: StreamItem) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| PassthroughError::transport("outbound call already closed"))
    }
}

/// An open client-streaming or duplex call
pub struct StreamingCall {
    pub sender: CallSender,
    pub responses: ResponseStream,
}

impl std::fmt::Debug for StreamingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingCall")
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}

/// One multiplexed link to a backend instance
#[async_trait]
pub trait Connection: Send + Sync + Debug {
    async fn unary(&self, method: &str, metadata: &CallMetadata, payload: Bytes) -> Result<Bytes>;

    async fn server_stream(
        &self,
        method: &str,
        metadata: &CallMetadata,
        payload: Bytes,
    ) -> Result<ResponseStream>;

    /// Open a client-streaming or duplex call
    async fn open_stream(
        &self,
        method: &str,
        metadata: &CallMetadata,
        kind: CallKind,
    ) -> Result<StreamingCall>;

    /// Fire-and-forget push with no call attached
    async fn notify(&self, method: &str, payload: Bytes) -> Result<()>;

    /// Tear the link down; calls in flight fail with a transport error
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Opens connections to registered instances
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    async fn connect(&self, entry: &ServiceEntry) -> Result<Arc<dyn Connection>>;
}
