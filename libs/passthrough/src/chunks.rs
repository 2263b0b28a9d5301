//! Chunk Reassembler
//!
//! Rebuilds one binary payload (an image, typically) from an ordered stream
//! of fragments. The first chunk declares the total length and carries the
//! payload metadata; the buffer is allocated once at exactly that size.
//! Nothing reaches the [`PayloadSink`] unless the stream ends with every
//! declared byte written and no byte more.

use crate::error::{PassthroughError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default ceiling on a declared payload length
pub const DEFAULT_MAX_PAYLOAD_LEN: u64 = 256 * 1024 * 1024; // 256MB

/// One fragment of a chunked transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub payload: Bytes,
    /// Declared size of the whole transfer; only the first chunk's counts
    pub total_length: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub result_id: String,
    pub iteration_id: String,
}

/// Metadata captured from the first chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadMeta {
    pub result_id: String,
    pub iteration_id: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassembledPayload {
    pub meta: PayloadMeta,
    pub data: Bytes,
}

/// Storage collaborator receiving completed payloads
#[async_trait]
pub trait PayloadSink: Send + Sync {
    /// Persist `payload`, returning the response for the uploader
    async fn store(&self, payload: ReassembledPayload) -> Result<Bytes>;
}

#[derive(Debug)]
struct Transfer {
    buffer: Vec<u8>,
    total_length: usize,
    meta: PayloadMeta,
}

/// Per-transfer reassembly state
#[derive(Debug)]
pub struct Reassembler {
    max_payload_len: u64,
    transfer: Option<Transfer>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_LEN)
    }
}

impl Reassembler {
    pub fn new(max_payload_len: u64) -> Self {
        Self {
            max_payload_len,
            transfer: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.transfer.is_some()
    }

    pub fn bytes_written(&self) -> usize {
        self.transfer.as_ref().map_or(0, |t| t.buffer.len())
    }

    /// Copy `chunk` in at the current offset
    ///
    /// Any error discards the transfer.
    pub fn push(&mut self, chunk: Chunk) -> Result<()> {
        let result = self.try_push(chunk);
        if result.is_err() {
            self.transfer = None;
        }
        result
    }

    fn try_push(&mut self, chunk: Chunk) -> Result<()> {
        if self.transfer.is_none() {
            self.transfer = Some(self.start(&chunk)?);
        }
        let Some(transfer) = self.transfer.as_mut() else {
            return Err(PassthroughError::corrupt("transfer was not started"));
        };

        let end = transfer.buffer.len() + chunk.payload.len();
        if end > transfer.total_length {
            return Err(PassthroughError::corrupt(format!(
                "chunk overruns declared length: {} > {}",
                end, transfer.total_length
            )));
        }
        transfer.buffer.extend_from_slice(&chunk.payload);
        Ok(())
    }

    fn start(&self, first: &Chunk) -> Result<Transfer> {
        if first.total_length > self.max_payload_len {
            return Err(PassthroughError::corrupt(format!(
                "declared length {} exceeds limit of {}",
                first.total_length, self.max_payload_len
            )));
        }
        let total_length = usize::try_from(first.total_length).map_err(|_| {
            PassthroughError::corrupt(format!(
                "declared length {} does not fit in memory",
                first.total_length
            ))
        })?;
        debug!(
            result_id = %first.result_id,
            total_length,
            "Starting chunked transfer"
        );
        Ok(Transfer {
            buffer: Vec::with_capacity(total_length),
            total_length,
            meta: PayloadMeta {
                result_id: first.result_id.clone(),
                iteration_id: first.iteration_id.clone(),
                width: first.width,
                height: first.height,
            },
        })
    }

    /// Complete the transfer; the written length must match exactly
    pub fn finish(&mut self) -> Result<ReassembledPayload> {
        let transfer = self
            .transfer
            .take()
            .ok_or_else(|| PassthroughError::corrupt("transfer ended before its first chunk"))?;

        if transfer.buffer.len() != transfer.total_length {
            return Err(PassthroughError::corrupt(format!(
                "received {} of {} declared bytes",
                transfer.buffer.len(),
                transfer.total_length
            )));
        }
        Ok(ReassembledPayload {
            meta: transfer.meta,
            data: Bytes::from(transfer.buffer),
        })
    }

    /// Drive a whole chunk stream to a payload
    pub async fn reassemble<S>(mut self, mut chunks: S) -> Result<ReassembledPayload>
    where
        S: Stream<Item = Result<Chunk>> + Unpin,
    {
        while let Some(chunk) = chunks.next().await {
            self.push(chunk?)?;
        }
        self.finish()
    }
}

/// Reassemble `chunks` and hand the result to `sink` only on success
pub async fn receive_payload<S>(
    chunks: S,
    max_payload_len: u64,
    sink: &dyn PayloadSink,
) -> Result<Bytes>
where
    S: Stream<Item = Result<Chunk>> + Unpin,
{
    let payload = match Reassembler::new(max_payload_len).reassemble(chunks).await {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Discarding chunked transfer");
            return Err(e);
        }
    };
    sink.store(payload).await
}

/// Split `data` into an ordered chunk sequence
///
/// Metadata rides on the first chunk only; an empty payload still yields
/// one (empty) chunk so the total length is declared.
pub fn split_payload(data: &Bytes, chunk_size: usize, meta: &PayloadMeta) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let total_length = data.len() as u64;
    let mut chunks = Vec::with_capacity(data.len() / chunk_size + 1);

    let mut offset = 0;
    loop {
        let end = (offset + chunk_size).min(data.len());
        let first = offset == 0;
        chunks.push(Chunk {
            payload: data.slice(offset..end),
            total_length,
            width: if first { meta.width } else { None },
            height: if first { meta.height } else { None },
            result_id: meta.result_id.clone(),
            iteration_id: meta.iteration_id.clone(),
        });
        offset = end;
        if offset >= data.len() {
            break;
        }
    }
    chunks
}
