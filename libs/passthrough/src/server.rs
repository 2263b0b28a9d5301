//! Inbound side of the framed RPC protocol
//!
//! Backends implement [`Handler`] and call [`serve`]; the gateway uses the
//! same loop for the calls it receives. Every call runs on its own task and
//! is dropped as soon as the caller sends `Cancel` or the connection goes
//! away, which is how cancellation reaches whatever the handler was awaiting.
//!
//! The connection reader never waits on one call. A call whose handler falls
//! more than `call_buffer` request items behind is cancelled and answered
//! with `ResourceExhausted`.

use crate::error::{Result, Status, StatusCode};
use crate::message::{receiver_stream, CallKind, CallMetadata, ItemStream, StreamItem};
use crate::tcp::write_frames;
use crate::wire::{Frame, FrameCodec, DEFAULT_MAX_FRAME_LEN};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Responses produced by a streaming handler
pub type StatusStream = BoxStream<'static, std::result::Result<Bytes, Status>>;

/// Serves calls arriving over the framed protocol
///
/// Methods a handler does not override answer `Unimplemented`.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn unary(
        &self,
        method: &str,
        metadata: CallMetadata,
        payload: Bytes,
    ) -> std::result::Result<Bytes, Status>;

    async fn server_stream(
        &self,
        method: &str,
        _metadata: CallMetadata,
        _payload: Bytes,
    ) -> std::result::Result<StatusStream, Status> {
        Err(Status::unimplemented(method))
    }

    async fn client_stream(
        &self,
        method: &str,
        _metadata: CallMetadata,
        _items: ItemStream,
    ) -> std::result::Result<Bytes, Status> {
        Err(Status::unimplemented(method))
    }

    async fn duplex(
        &self,
        method: &str,
        _metadata: CallMetadata,
        _items: ItemStream,
    ) -> std::result::Result<StatusStream, Status> {
        Err(Status::unimplemented(method))
    }

    /// Fire-and-forget push; nothing is sent back
    async fn notify(&self, _method: &str, _payload: Bytes) {}
}

/// Inbound connection settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_frame_len: usize,
    pub outbound_buffer: usize,
    /// Request items buffered per call; overflowing it fails that call
    pub call_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            outbound_buffer: 1024,
            call_buffer: 64,
        }
    }
}

/// Accept connections until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, "RPC listener started");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer, error = %e, "Could not disable Nagle");
                }
                tokio::spawn(serve_connection(
                    stream,
                    peer,
                    Arc::clone(&handler),
                    config.clone(),
                    shutdown.child_token(),
                ));
            }
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }

    info!(addr = %local, "RPC listener stopped");
    Ok(())
}

struct InboundCall {
    items: Option<mpsc::Sender<StreamItem>>,
    cancel: CancellationToken,
}

/// Serve every call on one accepted connection
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn Handler>,
    config: ServerConfig,
    shutdown: CancellationToken,
) {
    debug!(peer = %peer, "Connection accepted");
    let (read_half, write_half) = stream.into_split();
    let (out, out_rx) = mpsc::channel(config.outbound_buffer);
    tokio::spawn(write_frames(
        FramedWrite::new(write_half, FrameCodec::new(config.max_frame_len)),
        out_rx,
        shutdown.clone(),
        peer.to_string(),
    ));

    let calls: Arc<DashMap<u64, InboundCall>> = Arc::new(DashMap::new());
    let mut frames = FramedRead::new(read_half, FrameCodec::new(config.max_frame_len));

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(peer = %peer, error = %e, "Dropping connection on bad frame");
                break;
            }
            None => break,
        };

        match frame {
            Frame::Open {
                call_id,
                method,
                kind,
                metadata,
            } => {
                let (items_tx, items_rx) = mpsc::channel(config.call_buffer.max(1));
                let cancel = shutdown.child_token();
                calls.insert(
                    call_id,
                    InboundCall {
                        items: Some(items_tx),
                        cancel: cancel.clone(),
                    },
                );
                tokio::spawn(run_call(
                    Arc::clone(&handler),
                    call_id,
                    method,
                    kind,
                    metadata,
                    receiver_stream(items_rx),
                    out.clone(),
                    cancel,
                    Arc::clone(&calls),
                ));
            }
            Frame::Message { call_id, item } => {
                let items = calls.get(&call_id).and_then(|c| c.items.clone());
                if let Some(items) = items {
                    if let Err(TrySendError::Full(_)) = items.try_send(item) {
                        overflow(&calls, call_id, &out, &peer);
                    }
                }
            }
            Frame::HalfClose { call_id } => {
                if let Some(mut call) = calls.get_mut(&call_id) {
                    call.items = None;
                }
            }
            Frame::Cancel { call_id } => {
                if let Some((_, call)) = calls.remove(&call_id) {
                    debug!(peer = %peer, call_id, "Call cancelled by caller");
                    call.cancel.cancel();
                }
            }
            Frame::Notify { method, payload } => {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { handler.notify(&method, payload).await });
            }
            other => debug!(peer = %peer, frame = ?other, "Ignoring unexpected frame"),
        }
    }

    shutdown.cancel();
    debug!(peer = %peer, "Connection closed");
}

/// Drop a call whose handler is not reading its request items
///
/// The reader moves on immediately; the error frame is sent from its own
/// task.
fn overflow(
    calls: &DashMap<u64, InboundCall>,
    call_id: u64,
    out: &mpsc::Sender<Frame>,
    peer: &SocketAddr,
) {
    let Some((_, call)) = calls.remove(&call_id) else {
        return;
    };
    warn!(peer = %peer, call_id, "Request queue full, dropping call");
    call.cancel.cancel();

    let frame = Frame::Error {
        call_id,
        status: Status::new(
            StatusCode::ResourceExhausted,
            format!("call {} is not reading its requests fast enough", call_id),
        ),
    };
    let out = out.clone();
    tokio::spawn(async move {
        let _ = out.send(frame).await;
    });
}

#[allow(clippy::too_many_arguments)]
async fn run_call(
    handler: Arc<dyn Handler>,
    call_id: u64,
    method: String,
    kind: CallKind,
    metadata: CallMetadata,
    items: ItemStream,
    out: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    calls: Arc<DashMap<u64, InboundCall>>,
) {
    let work = respond(handler.as_ref(), call_id, &method, kind, metadata, items, &out);
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = work => {
            let frame = match result {
                Ok(()) => Frame::End { call_id },
                Err(status) => {
                    debug!(method = %method, call_id, status = %status, "Call failed");
                    Frame::Error { call_id, status }
                }
            };
            let _ = out.send(frame).await;
        }
    }
    calls.remove(&call_id);
}

async fn respond(
    handler: &dyn Handler,
    call_id: u64,
    method: &str,
    kind: CallKind,
    metadata: CallMetadata,
    mut items: ItemStream,
    out: &mpsc::Sender<Frame>,
) -> std::result::Result<(), Status> {
    match kind {
        CallKind::Unary => {
            let request = first_item(&mut items, method).await?;
            let response = handler.unary(method, metadata, request.payload).await?;
            send_response(out, call_id, response).await
        }
        CallKind::ServerStream => {
            let request = first_item(&mut items, method).await?;
            let responses = handler
                .server_stream(method, metadata, request.payload)
                .await?;
            forward_responses(out, call_id, responses).await
        }
        CallKind::ClientStream => {
            let response = handler.client_stream(method, metadata, items).await?;
            send_response(out, call_id, response).await
        }
        CallKind::Duplex => {
            let responses = handler.duplex(method, metadata, items).await?;
            forward_responses(out, call_id, responses).await
        }
    }
}

async fn first_item(items: &mut ItemStream, method: &str) -> std::result::Result<StreamItem, Status> {
    items.next().await.ok_or_else(|| {
        Status::invalid_argument(format!("call '{}' closed without a request", method))
    })
}

async fn forward_responses(
    out: &mpsc::Sender<Frame>,
    call_id: u64,
    mut responses: StatusStream,
) -> std::result::Result<(), Status> {
    while let Some(response) = responses.next().await {
        send_response(out, call_id, response?).await?;
    }
    Ok(())
}

async fn send_response(
    out: &mpsc::Sender<Frame>,
    call_id: u64,
    payload: Bytes,
) -> std::result::Result<(), Status> {
    out.send(Frame::Response { call_id, payload })
        .await
        .map_err(|_| Status::new(StatusCode::Cancelled, "connection closed"))
}
