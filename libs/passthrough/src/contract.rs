//! Client contracts
//!
//! Each backend RPC contract gets one client type. Factories for them are
//! registered at startup under the contract's name and looked up when the
//! cache binds a client to a channel, so the cache never needs to know the
//! concrete client types.

use crate::channel::ChannelHandle;
use crate::connection::StreamingCall;
use crate::error::{PassthroughError, Result};
use crate::message::{CallKind, CallMetadata, ResponseStream};
use bytes::Bytes;
use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A backend RPC contract and the client that speaks it
pub trait Contract: 'static {
    const NAME: &'static str;
    type Client: Send + Sync + 'static;
}

type Factory = Arc<dyn Fn(Arc<ChannelHandle>) -> Box<dyn Any + Send + Sync> + Send + Sync>;

/// Type-erased client factories keyed by contract name
pub struct ClientFactories {
    factories: DashMap<&'static str, Factory>,
}

impl fmt::Debug for ClientFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&'static str> = self.factories.iter().map(|e| *e.key()).collect();
        names.sort_unstable();
        f.debug_struct("ClientFactories")
            .field("contracts", &names)
            .finish()
    }
}

impl Default for ClientFactories {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientFactories {
    /// Factories with [`Raw`] already registered
    pub fn new() -> Self {
        let factories = Self {
            factories: DashMap::new(),
        };
        factories.register::<Raw, _>(RawClient::new);
        factories
    }

    /// Register or replace the factory for contract `C`
    pub fn register<C, F>(&self, factory: F)
    where
        C: Contract,
        F: Fn(Arc<ChannelHandle>) -> C::Client + Send + Sync + 'static,
    {
        let erased: Factory = Arc::new(
            move |handle: Arc<ChannelHandle>| -> Box<dyn Any + Send + Sync> {
                Box::new(factory(handle))
            },
        );
        self.factories.insert(C::NAME, erased);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build a `C` client bound to `handle`
    pub fn create<C: Contract>(&self, handle: Arc<ChannelHandle>) -> Result<C::Client> {
        let factory = self
            .factories
            .get(C::NAME)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| {
                PassthroughError::protocol(format!("no client factory for contract '{}'", C::NAME))
            })?;

        factory(handle)
            .downcast::<C::Client>()
            .map(|client| *client)
            .map_err(|_| {
                PassthroughError::protocol(format!(
                    "factory for contract '{}' built the wrong client type",
                    C::NAME
                ))
            })
    }
}

/// Contract of opaque-payload calls, available for every backend
#[derive(Debug)]
pub struct Raw;

impl Contract for Raw {
    const NAME: &'static str = "raw";
    type Client = RawClient;
}

/// Client forwarding opaque payloads over a channel
#[derive(Debug, Clone)]
pub struct RawClient {
    handle: Arc<ChannelHandle>,
}

impl RawClient {
    pub fn new(handle: Arc<ChannelHandle>) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Arc<ChannelHandle> {
        &self.handle
    }

    pub fn unique_name(&self) -> &str {
        self.handle.unique_name()
    }

    pub async fn unary(
        &self,
        method: &str,
        metadata: &CallMetadata,
        payload: Bytes,
    ) -> Result<Bytes> {
        self.handle
            .connection()
            .unary(method, metadata, payload)
            .await
    }

    pub async fn server_stream(
        &self,
        method: &str,
        metadata: &CallMetadata,
        payload: Bytes,
    ) -> Result<ResponseStream> {
        self.handle
            .connection()
            .server_stream(method, metadata, payload)
            .await
    }

    pub async fn open_stream(
        &self,
        method: &str,
        metadata: &CallMetadata,
        kind: CallKind,
    ) -> Result<StreamingCall> {
        self.handle
            .connection()
            .open_stream(method, metadata, kind)
            .await
    }

    pub fn notify(&self, method: &str, payload: Bytes) -> Result<()> {
        self.handle.notify(method, payload)
    }
}
