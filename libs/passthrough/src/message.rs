//! Call envelopes shared by the transport, the router and backends

use crate::error::Result;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Stream of responses coming back from one outbound call
pub type ResponseStream = BoxStream<'static, Result<Bytes>>;

/// Stream of request items arriving on one inbound call
pub type ItemStream = BoxStream<'static, StreamItem>;

/// Cardinality of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallKind {
    Unary,
    ServerStream,
    ClientStream,
    Duplex,
}

impl CallKind {
    /// Whether the caller sends more than one request item
    pub fn is_client_streaming(&self) -> bool {
        matches!(self, CallKind::ClientStream | CallKind::Duplex)
    }
}

/// Per-call metadata forwarded along with every call
///
/// The credential is opaque here; backends validate it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetadata {
    /// Unique name of the single instance this call is addressed to
    pub target: Option<String>,
    pub credential: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl CallMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// One request item on a call
///
/// Only the first item of a relayed stream is consulted for `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamItem {
    pub target: Option<String>,
    pub payload: Bytes,
}

impl StreamItem {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            target: None,
            payload: payload.into(),
        }
    }

    pub fn targeted(target: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            target: Some(target.into()),
            payload: payload.into(),
        }
    }
}

/// Adapt a channel receiver into a boxed stream
pub fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
        .boxed()
}
