//! Channel handles
//!
//! A [`ChannelHandle`] is the cache's record of one open connection to one
//! registered instance. It is closed exactly once, when the registry entry
//! it was opened for goes away.

use crate::connection::Connection;
use crate::error::{PassthroughError, Result};
use bytes::Bytes;
use registry::{ServiceEntry, ServiceId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Notification {
    method: String,
    payload: Bytes,
}

pub struct ChannelHandle {
    service_id: ServiceId,
    unique_name: String,
    service_type: String,
    url: String,
    connection: Arc<dyn Connection>,
    notifications: mpsc::Sender<Notification>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("service_id", &self.service_id)
            .field("unique_name", &self.unique_name)
            .field("service_type", &self.service_type)
            .field("url", &self.url)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ChannelHandle {
    /// Wrap `connection` for `entry` and start draining its notification queue
    pub fn new(
        entry: &ServiceEntry,
        connection: Arc<dyn Connection>,
        notification_queue: usize,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(notification_queue.max(1));
        let handle = Arc::new(Self {
            service_id: entry.id,
            unique_name: entry.unique_name.clone(),
            service_type: entry.service_type.clone(),
            url: entry.url.clone(),
            connection,
            notifications: tx,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(drain_notifications(
            rx,
            Arc::clone(&handle.connection),
            handle.shutdown.clone(),
            handle.unique_name.clone(),
        ));
        handle
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Queue a fire-and-forget push to this instance
    ///
    /// Fails only when the queue is full or the handle is closed; delivery
    /// failures after queueing are logged by the drain task.
    pub fn notify(&self, method: impl Into<String>, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(PassthroughError::transport(format!(
                "channel to {} is closed",
                self.unique_name
            )));
        }
        let notification = Notification {
            method: method.into(),
            payload,
        };
        match self.notifications.try_send(notification) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(n)) => {
                warn!(
                    unique_name = %self.unique_name,
                    method = %n.method,
                    "Notification queue full, dropping notification"
                );
                Err(PassthroughError::transport(format!(
                    "notification queue for {} is full",
                    self.unique_name
                )))
            }
            Err(TrySendError::Closed(_)) => Err(PassthroughError::transport(format!(
                "channel to {} is closed",
                self.unique_name
            ))),
        }
    }

    /// Close the underlying connection; later calls are no-ops
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.connection.close();
        info!(
            service_id = %self.service_id,
            unique_name = %self.unique_name,
            "Channel closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

async fn drain_notifications(
    mut rx: mpsc::Receiver<Notification>,
    connection: Arc<dyn Connection>,
    shutdown: CancellationToken,
    unique_name: String,
) {
    loop {
        let notification = tokio::select! {
            _ = shutdown.cancelled() => break,
            n = rx.recv() => n,
        };
        let Some(notification) = notification else { break };
        if let Err(e) = connection
            .notify(&notification.method, notification.payload)
            .await
        {
            warn!(
                unique_name = %unique_name,
                method = %notification.method,
                error = %e,
                "Notification delivery failed"
            );
        }
    }
    debug!(unique_name = %unique_name, "Notification drain stopped");
}
