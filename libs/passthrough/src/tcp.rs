//! TCP Transport
//!
//! Outbound side of the framed RPC protocol in [`crate::wire`]. Each
//! [`TcpConnection`] runs one reader task and one writer task over a single
//! socket and multiplexes calls over it by `call_id`. Dropping a call's
//! response stream before it ends sends `Cancel` to the backend.
//!
//! The reader never waits on a single call: a call whose response queue is
//! full is failed with `ResourceExhausted` and cancelled, so one slow
//! consumer cannot stall the other calls sharing the socket.

use crate::connection::{CallSender, Connection, Connector, StreamingCall};
use crate::error::{PassthroughError, Result};
use crate::message::{CallKind, CallMetadata, ResponseStream, StreamItem};
use crate::wire::{Frame, FrameCodec, DEFAULT_MAX_FRAME_LEN};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use registry::ServiceEntry;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound TCP settings
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub connect_timeout: Duration,
    pub max_frame_len: usize,
    /// Frames queued for the socket before callers wait
    pub outbound_buffer: usize,
    /// Responses queued per call; overflowing it fails that call
    pub call_buffer: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            outbound_buffer: 1024,
            call_buffer: 64,
        }
    }
}

/// Opens [`TcpConnection`]s to `tcp://host:port` service URLs
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TcpConfig,
}

impl TcpConnector {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

/// `host:port` of a registered service URL
pub fn socket_addr(service_url: &str) -> Result<String> {
    let parsed = url::Url::parse(service_url).map_err(|e| {
        PassthroughError::transport(format!("invalid service url '{}': {}", service_url, e))
    })?;
    let host = parsed.host_str().ok_or_else(|| {
        PassthroughError::transport(format!("service url '{}' has no host", service_url))
    })?;
    let port = parsed.port_or_known_default().ok_or_else(|| {
        PassthroughError::transport(format!("service url '{}' has no port", service_url))
    })?;
    Ok(format!("{}:{}", host, port))
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, entry: &ServiceEntry) -> Result<Arc<dyn Connection>> {
        let addr = socket_addr(&entry.url)?;
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| PassthroughError::Timeout(self.config.connect_timeout))??;
        stream.set_nodelay(true)?;

        info!(
            unique_name = %entry.unique_name,
            service_type = %entry.service_type,
            addr = %addr,
            "Connected to backend"
        );
        Ok(Arc::new(TcpConnection::from_stream(
            stream,
            entry.unique_name.clone(),
            &self.config,
        )))
    }
}

/// Final error of a call, kept aside when its queue has no room for it
type Terminal = Arc<Mutex<Option<PassthroughError>>>;

/// Reader-side half of one in-flight call
struct PendingCall {
    tx: mpsc::Sender<Result<Bytes>>,
    terminal: Terminal,
}

/// State shared between a connection and its reader/writer tasks
struct Link {
    peer: String,
    outbound: mpsc::Sender<Frame>,
    calls: DashMap<u64, PendingCall>,
    shutdown: CancellationToken,
}

impl Link {
    async fn send(&self, frame: Frame) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(self.closed());
        }
        self.outbound.send(frame).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> PassthroughError {
        PassthroughError::transport(format!("connection to {} closed", self.peer))
    }

    /// Fail every call still waiting on this link
    fn fail_all(&self) {
        let ids: Vec<u64> = self.calls.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.fail_call(id, self.closed());
        }
    }

    /// Forget `call_id`, ending its responses with `err`
    ///
    /// Items already queued are still delivered before the error.
    fn fail_call(&self, call_id: u64, err: PassthroughError) {
        let Some((_, call)) = self.calls.remove(&call_id) else {
            return;
        };
        if let Err(TrySendError::Full(Err(err))) = call.tx.try_send(Err(err)) {
            *call.terminal.lock() = Some(err);
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Response { call_id, payload } => {
                let tx = self.calls.get(&call_id).map(|e| e.value().tx.clone());
                let Some(tx) = tx else { return };
                match tx.try_send(Ok(payload)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            peer = %self.peer,
                            call_id,
                            "Response queue full, dropping call"
                        );
                        self.fail_call(
                            call_id,
                            PassthroughError::resource_exhausted(format!(
                                "call {} to {} is not being read fast enough",
                                call_id, self.peer
                            )),
                        );
                        if self.outbound.try_send(Frame::Cancel { call_id }).is_err() {
                            debug!(peer = %self.peer, call_id, "Could not queue Cancel");
                        }
                    }
                    Err(TrySendError::Closed(_)) => {
                        self.calls.remove(&call_id);
                    }
                }
            }
            Frame::End { call_id } => {
                self.calls.remove(&call_id);
            }
            Frame::Error { call_id, status } => {
                self.fail_call(call_id, PassthroughError::Upstream(status));
            }
            other => {
                debug!(peer = %self.peer, frame = ?other, "Ignoring unexpected frame from backend");
            }
        }
    }
}

/// Write queued frames to the socket until shutdown or a write failure
pub(crate) async fn write_frames<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
    peer: String,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = sink.send(frame).await {
            warn!(peer = %peer, error = %e, "Write failed, closing connection");
            break;
        }
    }
    shutdown.cancel();
}

async fn read_frames(mut frames: FramedRead<OwnedReadHalf, FrameCodec>, link: Arc<Link>) {
    loop {
        let frame = tokio::select! {
            _ = link.shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => link.dispatch(frame),
            Some(Err(e)) => {
                warn!(peer = %link.peer, error = %e, "Read failed, closing connection");
                break;
            }
            None => {
                debug!(peer = %link.peer, "Backend closed connection");
                break;
            }
        }
    }
    link.shutdown.cancel();
    link.fail_all();
}

/// Responses of one outbound call
struct CallResponses {
    call_id: u64,
    rx: mpsc::Receiver<Result<Bytes>>,
    terminal: Terminal,
    link: Arc<Link>,
    done: CancellationToken,
    finished: bool,
}

impl Stream for CallResponses {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(None) = polled {
            self.finished = true;
            if let Some(err) = self.terminal.lock().take() {
                return Poll::Ready(Some(Err(err)));
            }
        }
        polled
    }
}

impl Drop for CallResponses {
    fn drop(&mut self) {
        self.done.cancel();
        if !self.finished && self.link.calls.remove(&self.call_id).is_some() {
            let _ = self.link.outbound.try_send(Frame::Cancel {
                call_id: self.call_id,
            });
        }
    }
}

/// Multiplexed framed connection to one backend instance
pub struct TcpConnection {
    link: Arc<Link>,
    next_call_id: AtomicU64,
    call_buffer: usize,
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer", &self.link.peer)
            .field("in_flight", &self.link.calls.len())
            .field("closed", &self.link.shutdown.is_cancelled())
            .finish()
    }
}

impl TcpConnection {
    /// Wrap a connected socket, spawning its reader and writer tasks
    pub fn from_stream(stream: TcpStream, peer: impl Into<String>, config: &TcpConfig) -> Self {
        let peer = peer.into();
        let (read_half, write_half) = stream.into_split();
        let (outbound, rx) = mpsc::channel(config.outbound_buffer);

        let link = Arc::new(Link {
            peer: peer.clone(),
            outbound,
            calls: DashMap::new(),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(write_frames(
            FramedWrite::new(write_half, FrameCodec::new(config.max_frame_len)),
            rx,
            link.shutdown.clone(),
            peer,
        ));
        tokio::spawn(read_frames(
            FramedRead::new(read_half, FrameCodec::new(config.max_frame_len)),
            Arc::clone(&link),
        ));

        Self {
            link,
            next_call_id: AtomicU64::new(1),
            call_buffer: config.call_buffer,
        }
    }

    async fn start_call(
        &self,
        method: &str,
        metadata: &CallMetadata,
        kind: CallKind,
    ) -> Result<CallResponses> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.call_buffer.max(1));
        let terminal = Terminal::default();
        self.link.calls.insert(
            call_id,
            PendingCall {
                tx,
                terminal: Arc::clone(&terminal),
            },
        );

        let responses = CallResponses {
            call_id,
            rx,
            terminal,
            link: Arc::clone(&self.link),
            done: self.link.shutdown.child_token(),
            finished: false,
        };
        self.link
            .send(Frame::Open {
                call_id,
                method: method.to_string(),
                kind,
                metadata: metadata.clone(),
            })
            .await?;
        Ok(responses)
    }

    async fn send_single(&self, call_id: u64, payload: Bytes) -> Result<()> {
        self.link
            .send(Frame::Message {
                call_id,
                item: StreamItem::new(payload),
            })
            .await?;
        self.link.send(Frame::HalfClose { call_id }).await
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn unary(&self, method: &str, metadata: &CallMetadata, payload: Bytes) -> Result<Bytes> {
        let mut responses = self.start_call(method, metadata, CallKind::Unary).await?;
        self.send_single(responses.call_id, payload).await?;

        let response = match responses.next().await {
            Some(response) => response?,
            None => {
                return Err(PassthroughError::protocol(format!(
                    "unary call '{}' ended without a response",
                    method
                )))
            }
        };
        match responses.next().await {
            None => Ok(response),
            Some(Err(e)) => Err(e),
            Some(Ok(_)) => Err(PassthroughError::protocol(format!(
                "unary call '{}' produced more than one response",
                method
            ))),
        }
    }

    async fn server_stream(
        &self,
        method: &str,
        metadata: &CallMetadata,
        payload: Bytes,
    ) -> Result<ResponseStream> {
        let responses = self
            .start_call(method, metadata, CallKind::ServerStream)
            .await?;
        self.send_single(responses.call_id, payload).await?;
        Ok(responses.boxed())
    }

    async fn open_stream(
        &self,
        method: &str,
        metadata: &CallMetadata,
        kind: CallKind,
    ) -> Result<StreamingCall> {
        if !kind.is_client_streaming() {
            return Err(PassthroughError::protocol(format!(
                "{:?} is not a client-streaming call kind",
                kind
            )));
        }

        let responses = self.start_call(method, metadata, kind).await?;
        let call_id = responses.call_id;
        let done = responses.done.clone();
        let link = Arc::clone(&self.link);
        let (item_tx, mut item_rx) = mpsc::channel::<StreamItem>(self.call_buffer.max(1));

        // Pump request items onto the socket; sender drop half-closes
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = done.cancelled() => return,
                    item = item_rx.recv() => item,
                };
                let frame = match item {
                    Some(item) => Frame::Message { call_id, item },
                    None => Frame::HalfClose { call_id },
                };
                let half_close = matches!(frame, Frame::HalfClose { .. });
                if link.send(frame).await.is_err() || half_close {
                    return;
                }
            }
        });

        Ok(StreamingCall {
            sender: CallSender::new(item_tx),
            responses: responses.boxed(),
        })
    }

    async fn notify(&self, method: &str, payload: Bytes) -> Result<()> {
        self.link
            .send(Frame::Notify {
                method: method.to_string(),
                payload,
            })
            .await
    }

    fn close(&self) {
        if !self.link.shutdown.is_cancelled() {
            debug!(peer = %self.link.peer, "Closing connection");
        }
        self.link.shutdown.cancel();
        self.link.fail_all();
    }

    fn is_closed(&self) -> bool {
        self.link.shutdown.is_cancelled()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.link.shutdown.cancel();
    }
}
