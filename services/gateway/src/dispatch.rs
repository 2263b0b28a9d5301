//! Inbound call dispatch
//!
//! [`GatewayHandler`] receives every call made against the gateway's RPC
//! listener, looks its method up in the [`RouteTable`], and hands it to the
//! matching [`Router`] strategy. Router errors leave as wire statuses;
//! backend statuses pass through unchanged.
//!
//! The server loop drops a call's future when the caller cancels, so
//! strategies awaited inline are cancelled by drop. Streaming strategies run
//! on their own task and are cancelled through the call's token when the
//! response stream is dropped.

use crate::results::ResultsSink;
use crate::routes::{Route, RouteMode, RouteTable};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, stream, StreamExt};
use passthrough::message::receiver_stream;
use passthrough::{
    receive_payload, CallContext, CallMetadata, ChannelSink, Chunk, Handler, ItemStream,
    OutboundSink, PassthroughError, RelayMode, Router, Status, StatusStream,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Responses buffered per streamed call before the router waits
const RESPONSE_BUFFER: usize = 64;

pub struct GatewayHandler {
    router: Arc<Router>,
    routes: Arc<RouteTable>,
    max_payload_len: u64,
}

impl GatewayHandler {
    pub fn new(router: Arc<Router>, routes: Arc<RouteTable>, max_payload_len: u64) -> Self {
        Self {
            router,
            routes,
            max_payload_len,
        }
    }

    fn route(&self, method: &str) -> Result<Route, Status> {
        self.routes.get(method).cloned().ok_or_else(|| {
            debug!(method = %method, "No route for method");
            Status::unimplemented(method)
        })
    }

    /// Run a streaming strategy on its own task, feeding the returned stream
    ///
    /// Dropping the stream cancels the strategy. A strategy failure becomes
    /// the stream's final item.
    fn spawn_streamed<F, Fut>(&self, ctx: CallContext, strategy: F) -> StatusStream
    where
        F: FnOnce(Arc<Router>, CallContext, ChannelSink) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = passthrough::Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = ctx.cancel.clone();
        let router = Arc::clone(&self.router);

        tokio::spawn(async move {
            let outcome = strategy(router, ctx, ChannelSink::new(tx)).await;
            let _ = done_tx.send(outcome);
        });

        let guard = cancel.drop_guard();
        let tail = stream::once(async move {
            match done_rx.await {
                Ok(Err(e)) => Some(Err(e.to_status())),
                _ => None,
            }
        })
        .filter_map(future::ready);

        receiver_stream(rx)
            .map(Ok)
            .chain(tail)
            .map(move |item| {
                let _cancel_on_drop = &guard;
                item
            })
            .boxed()
    }
}

fn context(method: &str, metadata: CallMetadata) -> CallContext {
    CallContext::new(method).with_metadata(metadata)
}

fn wrong_mode(route: &Route, call: &str) -> Status {
    Status::invalid_argument(format!(
        "method '{}' is routed as {}, not as a {} call",
        route.method, route.mode, call
    ))
}

/// Holds the single response of a client-streaming relay
#[derive(Default)]
struct ResponseSlot(Option<Bytes>);

#[async_trait]
impl OutboundSink for ResponseSlot {
    async fn write(&mut self, item: Bytes) -> passthrough::Result<()> {
        self.0 = Some(item);
        Ok(())
    }
}

#[async_trait]
impl Handler for GatewayHandler {
    async fn unary(
        &self,
        method: &str,
        metadata: CallMetadata,
        payload: Bytes,
    ) -> Result<Bytes, Status> {
        let route = self.route(method)?;
        let ctx = context(method, metadata);
        match route.mode {
            RouteMode::Unary => self
                .router
                .unary(&ctx, payload)
                .await
                .map_err(|e| e.to_status()),
            RouteMode::Broadcast => {
                let report = self
                    .router
                    .broadcast(&route.service_type, &route.feature(), &ctx, payload)
                    .await
                    .map_err(|e| e.to_status())?;
                debug!(
                    method = %method,
                    attempted = report.attempted,
                    delivered = report.delivered,
                    "Broadcast answered"
                );
                Ok(Bytes::new())
            }
            _ => Err(wrong_mode(&route, "unary")),
        }
    }

    async fn server_stream(
        &self,
        method: &str,
        metadata: CallMetadata,
        payload: Bytes,
    ) -> Result<StatusStream, Status> {
        let route = self.route(method)?;
        if route.mode != RouteMode::Merge {
            return Err(wrong_mode(&route, "server-streaming"));
        }

        let ctx = context(method, metadata);
        Ok(self.spawn_streamed(ctx, move |router, ctx, sink| async move {
            router
                .server_stream_merge(&route.service_type, &route.feature(), &ctx, payload, sink)
                .await
                .map(|_| ())
        }))
    }

    async fn client_stream(
        &self,
        method: &str,
        metadata: CallMetadata,
        items: ItemStream,
    ) -> Result<Bytes, Status> {
        let route = self.route(method)?;
        let ctx = context(method, metadata);
        match route.mode {
            RouteMode::ClientStream => {
                let mut slot = ResponseSlot::default();
                self.router
                    .relay(&ctx, RelayMode::ClientStream, items, &mut slot)
                    .await
                    .map_err(|e| e.to_status())?;
                slot.0
                    .ok_or_else(|| Status::internal("relay finished without a response"))
            }
            RouteMode::Reassemble => {
                let chunks = items.map(|item| {
                    bincode::deserialize::<Chunk>(&item.payload).map_err(PassthroughError::from)
                });
                let sink = ResultsSink::new(Arc::clone(self.router.cache()), ctx.metadata);
                receive_payload(chunks, self.max_payload_len, &sink)
                    .await
                    .map_err(|e| {
                        warn!(method = %method, error = %e, "Upload failed");
                        e.to_status()
                    })
            }
            _ => Err(wrong_mode(&route, "client-streaming")),
        }
    }

    async fn duplex(
        &self,
        method: &str,
        metadata: CallMetadata,
        items: ItemStream,
    ) -> Result<StatusStream, Status> {
        let route = self.route(method)?;
        if route.mode != RouteMode::Duplex {
            return Err(wrong_mode(&route, "bidirectional"));
        }

        let ctx = context(method, metadata);
        Ok(self.spawn_streamed(ctx, move |router, ctx, mut sink| async move {
            router
                .relay(&ctx, RelayMode::Duplex, items, &mut sink)
                .await
                .map(|_| ())
        }))
    }

    async fn notify(&self, method: &str, payload: Bytes) {
        match self.routes.get(method) {
            Some(route) if route.mode == RouteMode::Broadcast => {
                self.router
                    .notify_all(&route.service_type, method, payload)
                    .await;
            }
            _ => debug!(method = %method, "Dropping notification without a broadcast route"),
        }
    }
}
