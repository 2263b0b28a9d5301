//! In-memory connections and sinks for exercising routing without sockets

use crate::chunks::{PayloadSink, ReassembledPayload};
use crate::connection::{CallSender, Connection, Connector, StreamingCall};
use crate::error::{PassthroughError, Result, Status};
use crate::message::{CallKind, CallMetadata, ResponseStream, StreamItem};
use crate::writer::OutboundSink;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{stream, Stream, StreamExt};
use parking_lot::Mutex;
use registry::ServiceEntry;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

/// A call as seen by a [`MockConnection`]
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub kind: CallKind,
    pub metadata: CallMetadata,
    pub payload: Bytes,
}

/// Scripted backend connection
///
/// Unary calls answer `"<name>:<method>"`; server streams replay the
/// configured items; client streams answer with the item count; duplex
/// calls echo every item.
#[derive(Debug)]
pub struct MockConnection {
    name: String,
    closed: AtomicBool,
    close_count: AtomicUsize,
    fail_with: Mutex<Option<Status>>,
    stream_items: Mutex<Vec<Bytes>>,
    item_delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
    received: Arc<Mutex<Vec<StreamItem>>>,
    notifications: Mutex<Vec<(String, Bytes)>>,
    abandoned_streams: Arc<AtomicUsize>,
}

impl MockConnection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            fail_with: Mutex::new(None),
            stream_items: Mutex::new(Vec::new()),
            item_delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            received: Arc::new(Mutex::new(Vec::new())),
            notifications: Mutex::new(Vec::new()),
            abandoned_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fail every following call with `status`
    pub fn fail_with(&self, status: Status) {
        *self.fail_with.lock() = Some(status);
    }

    pub fn set_stream_items(&self, items: Vec<Bytes>) {
        *self.stream_items.lock() = items;
    }

    /// Pause before yielding each server-stream item
    pub fn set_item_delay(&self, delay: Duration) {
        *self.item_delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Items received on client-streaming and duplex calls
    pub fn received_items(&self) -> Vec<StreamItem> {
        self.received.lock().clone()
    }

    pub fn notifications(&self) -> Vec<(String, Bytes)> {
        self.notifications.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Server streams dropped by the caller before they ended
    pub fn abandoned_streams(&self) -> usize {
        self.abandoned_streams.load(Ordering::SeqCst)
    }

    fn record(&self, method: &str, kind: CallKind, metadata: &CallMetadata, payload: Bytes) {
        self.calls.lock().push(RecordedCall {
            method: method.to_string(),
            kind,
            metadata: metadata.clone(),
            payload,
        });
    }

    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PassthroughError::transport(format!(
                "connection to {} closed",
                self.name
            )));
        }
        match self.fail_with.lock().clone() {
            Some(status) => Err(PassthroughError::Upstream(status)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn unary(&self, method: &str, metadata: &CallMetadata, payload: Bytes) -> Result<Bytes> {
        self.record(method, CallKind::Unary, metadata, payload);
        self.check()?;
        Ok(Bytes::from(format!("{}:{}", self.name, method)))
    }

    async fn server_stream(
        &self,
        method: &str,
        metadata: &CallMetadata,
        payload: Bytes,
    ) -> Result<ResponseStream> {
        self.record(method, CallKind::ServerStream, metadata, payload);
        self.check()?;

        let items = self.stream_items.lock().clone();
        let delay = *self.item_delay.lock();
        let inner = stream::iter(items)
            .then(move |item| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(item)
            })
            .boxed();

        Ok(TrackedStream {
            inner,
            finished: false,
            abandoned: Arc::clone(&self.abandoned_streams),
        }
        .boxed())
    }

    async fn open_stream(
        &self,
        method: &str,
        metadata: &CallMetadata,
        kind: CallKind,
    ) -> Result<StreamingCall> {
        self.record(method, kind, metadata, Bytes::new());
        let (item_tx, mut item_rx) = mpsc::channel::<StreamItem>(16);

        if let Err(e) = self.check() {
            return Ok(StreamingCall {
                sender: CallSender::new(item_tx),
                responses: stream::once(async move { Err(e) }).boxed(),
            });
        }

        let (resp_tx, resp_rx) = mpsc::channel::<Result<Bytes>>(16);
        let received = Arc::clone(&self.received);
        tokio::spawn(async move {
            let mut count = 0usize;
            while let Some(item) = item_rx.recv().await {
                received.lock().push(item.clone());
                count += 1;
                if kind == CallKind::Duplex && resp_tx.send(Ok(item.payload)).await.is_err() {
                    return;
                }
            }
            if kind == CallKind::ClientStream {
                let _ = resp_tx.send(Ok(Bytes::from(count.to_string()))).await;
            }
        });

        Ok(StreamingCall {
            sender: CallSender::new(item_tx),
            responses: crate::message::receiver_stream(resp_rx),
        })
    }

    async fn notify(&self, method: &str, payload: Bytes) -> Result<()> {
        self.check()?;
        self.notifications.lock().push((method.to_string(), payload));
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Counts streams dropped before their last item
struct TrackedStream {
    inner: ResponseStream,
    finished: bool,
    abandoned: Arc<AtomicUsize>,
}

impl Stream for TrackedStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.poll_next_unpin(cx);
        if let Poll::Ready(None) = polled {
            self.finished = true;
        }
        polled
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        if !self.finished {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Hands out one [`MockConnection`] per unique name
#[derive(Debug, Default)]
pub struct MockConnector {
    connections: DashMap<String, Arc<MockConnection>>,
    connects: AtomicUsize,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current connection for `unique_name`, created if needed
    ///
    /// Lets a test script a backend before the cache connects to it.
    pub fn connection(&self, unique_name: &str) -> Arc<MockConnection> {
        Arc::clone(
            self.connections
                .entry(unique_name.to_string())
                .or_insert_with(|| Arc::new(MockConnection::new(unique_name)))
                .value(),
        )
    }

    pub fn fail_connect(&self, unique_name: &str) {
        self.failing.lock().insert(unique_name.to_string());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, entry: &ServiceEntry) -> Result<Arc<dyn Connection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(&entry.unique_name) {
            return Err(PassthroughError::transport(format!(
                "connection refused by {}",
                entry.unique_name
            )));
        }

        let mut connection = self.connection(&entry.unique_name);
        if connection.is_closed() {
            connection = Arc::new(MockConnection::new(entry.unique_name.clone()));
            self.connections
                .insert(entry.unique_name.clone(), Arc::clone(&connection));
        }
        Ok(connection)
    }
}

/// Outbound sink that records items and flags overlapping writes
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    active: Arc<AtomicUsize>,
    overlaps: Arc<AtomicUsize>,
    items: Arc<Mutex<Vec<Bytes>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<Bytes> {
        self.items.lock().clone()
    }

    /// Writes that started while another was still in progress
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboundSink for RecordingSink {
    async fn write(&mut self, item: Bytes) -> Result<()> {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        // Widen the window a concurrent writer would have to hit
        tokio::task::yield_now().await;
        self.items.lock().push(item);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Payload sink keeping everything in memory
#[derive(Debug, Default)]
pub struct MemoryPayloadSink {
    stored: Mutex<Vec<ReassembledPayload>>,
}

impl MemoryPayloadSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(&self) -> Vec<ReassembledPayload> {
        self.stored.lock().clone()
    }
}

#[async_trait]
impl PayloadSink for MemoryPayloadSink {
    async fn store(&self, payload: ReassembledPayload) -> Result<Bytes> {
        let len = payload.data.len();
        self.stored.lock().push(payload);
        Ok(Bytes::from(format!("stored {} bytes", len)))
    }
}
