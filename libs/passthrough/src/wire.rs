//! RPC wire protocol
//!
//! Every frame is a bincode-encoded [`Frame`] behind a 4-byte big-endian
//! length prefix. One TCP connection multiplexes any number of calls, told
//! apart by a `call_id` chosen by the side that opened the call.
//!
//! ```text
//! caller                         callee
//!   Open{call_id, method, kind} ->
//!   Message{call_id, item}      ->   (one for unary/server-stream, n otherwise)
//!   HalfClose{call_id}          ->
//!                               <-   Response{call_id, payload}   (0..n)
//!                               <-   End{call_id} | Error{call_id, status}
//!   Cancel{call_id}             ->   (caller gave up, any time)
//! ```

use crate::error::{PassthroughError, Result, Status};
use crate::message::{CallKind, CallMetadata, StreamItem};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame accepted on either side
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024; // 16MB

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Open {
        call_id: u64,
        method: String,
        kind: CallKind,
        metadata: CallMetadata,
    },
    Message {
        call_id: u64,
        item: StreamItem,
    },
    HalfClose {
        call_id: u64,
    },
    Response {
        call_id: u64,
        payload: Bytes,
    },
    End {
        call_id: u64,
    },
    Error {
        call_id: u64,
        status: Status,
    },
    Cancel {
        call_id: u64,
    },
    Notify {
        method: String,
        payload: Bytes,
    },
}

impl Frame {
    pub fn call_id(&self) -> Option<u64> {
        match self {
            Frame::Open { call_id, .. }
            | Frame::Message { call_id, .. }
            | Frame::HalfClose { call_id }
            | Frame::Response { call_id, .. }
            | Frame::End { call_id }
            | Frame::Error { call_id, .. }
            | Frame::Cancel { call_id } => Some(*call_id),
            Frame::Notify { .. } => None,
        }
    }
}

/// Length-delimited bincode codec for [`Frame`]
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_len)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = PassthroughError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.inner.decode(src)? {
            Some(buf) => Ok(Some(bincode::deserialize(&buf)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = PassthroughError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let encoded = bincode::serialize(&frame)?;
        self.inner.encode(Bytes::from(encoded), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;

    #[test]
    fn test_frames_survive_partial_reads() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();

        let open = Frame::Open {
            call_id: 7,
            method: "Query".to_string(),
            kind: CallKind::ServerStream,
            metadata: CallMetadata::new()
                .with_credential("token-abc")
                .with_header("x-request-id", "r-1"),
        };
        let error = Frame::Error {
            call_id: 7,
            status: Status::new(StatusCode::NotFound, "no such project"),
        };
        codec.encode(open.clone(), &mut buf).unwrap();
        codec.encode(error.clone(), &mut buf).unwrap();

        // Feed the bytes back a few at a time
        let bytes = buf.split().freeze();
        let mut input = BytesMut::new();
        let mut decoded = Vec::new();
        for piece in bytes.chunks(5) {
            input.extend_from_slice(piece);
            while let Some(frame) = codec.decode(&mut input).unwrap() {
                decoded.push(frame);
            }
        }

        assert_eq!(decoded, vec![open, error]);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new(64);
        let mut buf = BytesMut::new();
        let frame = Frame::Notify {
            method: "Refresh".to_string(),
            payload: Bytes::from(vec![0u8; 1024]),
        };
        assert!(codec.encode(frame, &mut buf).is_err());
    }
}
