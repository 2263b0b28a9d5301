//! Single-writer outbound stream
//!
//! An [`OutboundSink`] is written through `&mut self`, so only its owner can
//! write. [`SingleWriter::spawn`] moves the sink into a dedicated task and
//! hands out cloneable [`WriterHandle`]s; producers queue items and the task
//! performs every write, one at a time, in queue order.

use crate::error::{PassthroughError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Destination of a relayed response stream
#[async_trait]
pub trait OutboundSink: Send + 'static {
    async fn write(&mut self, item: Bytes) -> Result<()>;
}

/// Sink feeding a channel, typically drained by the inbound connection
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl OutboundSink for ChannelSink {
    async fn write(&mut self, item: Bytes) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| PassthroughError::transport("caller went away"))
    }
}

/// Queue side of a spawned writer
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
}

impl WriterHandle {
    /// Queue `item`; fails once the writer has stopped
    pub async fn send(&self, item: Bytes) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| PassthroughError::transport("outbound stream closed"))
    }
}

pub struct SingleWriter;

impl SingleWriter {
    /// Move `sink` into its own task
    ///
    /// The task finishes once every handle is dropped and the queue is
    /// drained, returning the number of items written, or stops at the first
    /// failed write.
    pub fn spawn<S: OutboundSink>(
        mut sink: S,
        capacity: usize,
    ) -> (WriterHandle, JoinHandle<Result<u64>>) {
        let (tx, mut rx) = mpsc::channel::<Bytes>(capacity.max(1));
        let task = tokio::spawn(async move {
            let mut written = 0u64;
            while let Some(item) = rx.recv().await {
                sink.write(item).await?;
                written += 1;
            }
            debug!(written, "Outbound writer drained");
            Ok(written)
        });
        (WriterHandle { tx }, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_preserves_per_producer_order() {
        let (tx, mut rx) = mpsc::channel(64);
        let (handle, task) = SingleWriter::spawn(ChannelSink::new(tx), 4);

        let producers: Vec<_> = (0..2u8)
            .map(|p| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    for i in 0..5u8 {
                        handle.send(Bytes::from(vec![p, i])).await.unwrap();
                    }
                })
            })
            .collect();
        drop(handle);
        for p in producers {
            p.await.unwrap();
        }

        assert_eq!(task.await.unwrap().unwrap(), 10);

        let mut seen = Vec::new();
        while let Ok(item) = rx.try_recv() {
            seen.push((item[0], item[1]));
        }
        for p in 0..2u8 {
            let order: Vec<u8> = seen.iter().filter(|(q, _)| *q == p).map(|(_, i)| *i).collect();
            assert_eq!(order, vec![0, 1, 2, 3, 4]);
        }
    }

    #[tokio::test]
    async fn test_closed_sink_stops_producers() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (handle, task) = SingleWriter::spawn(ChannelSink::new(tx), 1);

        let _ = handle.send(Bytes::from_static(b"a")).await;
        assert!(task.await.unwrap().is_err());
        assert!(handle.send(Bytes::from_static(b"b")).await.is_err());
    }
}
