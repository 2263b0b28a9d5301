//! Channel Cache
//!
//! Sole owner of backend connections. Handles are opened lazily on first
//! use, reused across calls, and closed only when the registry removes the
//! entry they were opened for (or when the link is found already dead).
//!
//! Removal arrives through [`RemovalListener`] after the store has
//! published the new snapshot, so a connect racing a removal either sees
//! the entry gone on its post-insert check or has its handle evicted by the
//! listener. Either way the handle never outlives its entry.

use crate::channel::ChannelHandle;
use crate::connection::Connector;
use crate::contract::{ClientFactories, Contract};
use crate::error::{PassthroughError, Result};
use dashmap::DashMap;
use futures::future::join_all;
use registry::{RegistryStore, RemovalListener, RemovalReason, ServiceEntry};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Default bound of each handle's notification queue
pub const DEFAULT_NOTIFICATION_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub notification_queue: usize,
    pub connect_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            notification_queue: DEFAULT_NOTIFICATION_QUEUE,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

pub struct ChannelCache {
    store: Arc<RegistryStore>,
    connector: Arc<dyn Connector>,
    factories: Arc<ClientFactories>,
    handles: DashMap<String, Arc<ChannelHandle>>,
    /// Per-name connect locks so concurrent first use opens one connection
    connecting: DashMap<String, Arc<AsyncMutex<()>>>,
    config: CacheConfig,
}

impl fmt::Debug for ChannelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCache")
            .field("handles", &self.handles.len())
            .field("factories", &self.factories)
            .field("config", &self.config)
            .finish()
    }
}

/// Forwards store removals to the cache without keeping it alive
struct CacheListener(Weak<ChannelCache>);

impl RemovalListener for CacheListener {
    fn on_removed(&self, entry: &ServiceEntry, reason: RemovalReason) {
        if let Some(cache) = self.0.upgrade() {
            cache.evict(entry, reason);
        }
    }
}

impl ChannelCache {
    /// Create a cache and subscribe it to removals from `store`
    pub fn new(
        store: Arc<RegistryStore>,
        connector: Arc<dyn Connector>,
        factories: Arc<ClientFactories>,
        config: CacheConfig,
    ) -> Arc<Self> {
        let cache = Arc::new(Self {
            store: Arc::clone(&store),
            connector,
            factories,
            handles: DashMap::new(),
            connecting: DashMap::new(),
            config,
        });
        store.add_listener(Arc::new(CacheListener(Arc::downgrade(&cache))));
        cache
    }

    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    pub fn factories(&self) -> &Arc<ClientFactories> {
        &self.factories
    }

    /// Number of cached handles
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cached handle for `unique_name`, without connecting
    pub fn cached(&self, unique_name: &str) -> Option<Arc<ChannelHandle>> {
        self.handles.get(unique_name).map(|h| Arc::clone(h.value()))
    }

    /// Handle for the live entry named `unique_name`
    pub async fn resolve(&self, unique_name: &str) -> Result<Arc<ChannelHandle>> {
        let entry = self
            .store
            .lookup(unique_name)
            .ok_or_else(|| PassthroughError::not_found(unique_name))?;
        self.handle_for(&entry).await
    }

    /// Every live entry of `service_type` with its handle or connect failure
    pub async fn resolve_type(
        &self,
        service_type: &str,
    ) -> Vec<(ServiceEntry, Result<Arc<ChannelHandle>>)> {
        let entries = self.store.by_type(service_type);
        join_all(entries.into_iter().map(|entry| async move {
            let handle = self.handle_for(&entry).await;
            (entry, handle)
        }))
        .await
    }

    /// Live handles of `service_type`; instances that fail to connect are skipped
    pub async fn get_channels_by_type(&self, service_type: &str) -> Vec<Arc<ChannelHandle>> {
        self.resolve_type(service_type)
            .await
            .into_iter()
            .filter_map(|(entry, handle)| match handle {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(
                        unique_name = %entry.unique_name,
                        service_type = %service_type,
                        error = %e,
                        "Skipping instance that could not be reached"
                    );
                    None
                }
            })
            .collect()
    }

    /// `C` client bound to the live instance `unique_name`
    pub async fn create_client<C: Contract>(&self, unique_name: &str) -> Result<C::Client> {
        let handle = self.resolve(unique_name).await?;
        self.factories.create::<C>(handle)
    }

    /// `C` client bound to an already-resolved handle
    pub fn client_for<C: Contract>(&self, handle: Arc<ChannelHandle>) -> Result<C::Client> {
        self.factories.create::<C>(handle)
    }

    /// Close and forget every handle
    pub fn close_all(&self) {
        let names: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, handle)) = self.handles.remove(&name) {
                handle.close();
            }
        }
        self.connecting.clear();
    }

    fn usable_handle(&self, entry: &ServiceEntry) -> Option<Arc<ChannelHandle>> {
        self.handles
            .get(&entry.unique_name)
            .filter(|h| {
                h.service_id() == entry.id && !h.is_closed() && !h.connection().is_closed()
            })
            .map(|h| Arc::clone(h.value()))
    }

    async fn handle_for(&self, entry: &ServiceEntry) -> Result<Arc<ChannelHandle>> {
        if let Some(handle) = self.usable_handle(entry) {
            return Ok(handle);
        }

        let lock = Arc::clone(
            self.connecting
                .entry(entry.unique_name.clone())
                .or_default()
                .value(),
        );
        let _connecting = lock.lock().await;

        if let Some(handle) = self.usable_handle(entry) {
            return Ok(handle);
        }

        // Left over from an earlier registration, or its link died
        if let Some((_, stale)) = self.handles.remove(&entry.unique_name) {
            debug!(
                unique_name = %entry.unique_name,
                stale_id = %stale.service_id(),
                "Replacing unusable channel"
            );
            stale.close();
        }

        let connection =
            tokio::time::timeout(self.config.connect_timeout, self.connector.connect(entry))
                .await
                .map_err(|_| PassthroughError::Timeout(self.config.connect_timeout))??;
        let handle = ChannelHandle::new(entry, connection, self.config.notification_queue);
        self.handles
            .insert(entry.unique_name.clone(), Arc::clone(&handle));

        // Entry removed while connecting: the listener may have missed us
        if self.store.get(&entry.id).is_none() {
            self.handles
                .remove_if(&entry.unique_name, |_, h| h.service_id() == entry.id);
            handle.close();
            return Err(PassthroughError::not_found(entry.unique_name.clone()));
        }

        info!(
            service_id = %entry.id,
            unique_name = %entry.unique_name,
            service_type = %entry.service_type,
            "Channel opened"
        );
        Ok(handle)
    }

    fn evict(&self, entry: &ServiceEntry, reason: RemovalReason) {
        let removed = self
            .handles
            .remove_if(&entry.unique_name, |_, h| h.service_id() == entry.id);
        if let Some((_, handle)) = removed {
            info!(
                unique_name = %entry.unique_name,
                reason = ?reason,
                "Evicting channel of removed service"
            );
            handle.close();
        }
        // A connect still holding the lock keeps it for the next caller
        self.connecting
            .remove_if(&entry.unique_name, |_, lock| Arc::strong_count(lock) == 1);
    }
}
