//! Passthrough Router
//!
//! Forwards calls received by the gateway to live backend instances. Four
//! strategies, picked per method by cardinality and addressing:
//!
//! - **unary**: one named target, response or backend status returned as is
//! - **broadcast**: every live instance of a type, failures isolated
//! - **server-stream merge**: every live instance of a type, all items
//!   relayed into one outbound stream through a single writer task
//! - **relay**: client-streaming or duplex call to the target named by the
//!   first inbound item, forwarded item by item
//!
//! The router borrows clients from the [`ChannelCache`] and never opens or
//! closes connections itself. Cancelling a call's token, or dropping the
//! routing future, cancels every outbound call it started.

use crate::cache::ChannelCache;
use crate::channel::ChannelHandle;
use crate::connection::StreamingCall;
use crate::contract::Raw;
use crate::error::{PassthroughError, Result};
use crate::message::{CallKind, CallMetadata, ItemStream};
use crate::writer::{OutboundSink, SingleWriter, WriterHandle};
use bytes::Bytes;
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default bound on concurrent per-instance calls in a fan-out
pub const DEFAULT_MAX_FANOUT_CONCURRENCY: usize = 8;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Instances called at once by a broadcast or merge
    ///
    /// A merge only starts another instance once an earlier stream ends, so
    /// with more instances than this and never-ending streams the extra
    /// instances are not heard from.
    pub max_fanout_concurrency: usize,
    /// Limit for unary and broadcast calls
    pub call_timeout: Duration,
    /// Limit for merged and relayed streams
    pub stream_timeout: Duration,
    /// Items queued for the merge writer before producers wait
    pub merge_buffer: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_fanout_concurrency: DEFAULT_MAX_FANOUT_CONCURRENCY,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            merge_buffer: 64,
        }
    }
}

/// Which fan-out features must reach at least one live instance
#[derive(Debug, Clone, Default)]
pub struct FeaturePolicy {
    required: HashSet<String>,
    require_delivery: bool,
}

impl FeaturePolicy {
    pub fn new<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            required: required
                .into_iter()
                .map(|f| f.as_ref().to_ascii_lowercase())
                .collect(),
            require_delivery: false,
        }
    }

    /// Also fail required features when no attempted instance succeeded
    pub fn with_require_delivery(mut self, require_delivery: bool) -> Self {
        self.require_delivery = require_delivery;
        self
    }

    pub fn is_required(&self, feature: &str) -> bool {
        self.required.contains(&feature.to_ascii_lowercase())
    }

    pub fn require_delivery(&self) -> bool {
        self.require_delivery
    }
}

/// One inbound call being routed
#[derive(Debug, Clone)]
pub struct CallContext {
    pub method: String,
    pub metadata: CallMetadata,
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            metadata: CallMetadata::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: CallMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone)]
pub struct InstanceFailure {
    pub unique_name: String,
    pub error: PassthroughError,
}

/// Outcome of a broadcast
#[derive(Debug, Clone, Default)]
pub struct BroadcastReport {
    /// Live instances the call was attempted on
    pub attempted: usize,
    pub delivered: usize,
    pub failures: Vec<InstanceFailure>,
}

impl BroadcastReport {
    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.delivered == 0
    }
}

/// Outcome of a server-stream merge
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub instances: usize,
    /// Items written to the outbound stream
    pub items: u64,
    pub failures: Vec<InstanceFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMode {
    ClientStream,
    Duplex,
}

impl RelayMode {
    pub fn kind(&self) -> CallKind {
        match self {
            RelayMode::ClientStream => CallKind::ClientStream,
            RelayMode::Duplex => CallKind::Duplex,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySummary {
    pub target: String,
    /// Inbound items forwarded, the first included
    pub forwarded: u64,
    pub responses: u64,
}

#[derive(Debug)]
pub struct Router {
    cache: Arc<ChannelCache>,
    config: RouterConfig,
    policy: FeaturePolicy,
}

impl Router {
    pub fn new(cache: Arc<ChannelCache>, config: RouterConfig, policy: FeaturePolicy) -> Self {
        Self {
            cache,
            config,
            policy,
        }
    }

    pub fn cache(&self) -> &Arc<ChannelCache> {
        &self.cache
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn policy(&self) -> &FeaturePolicy {
        &self.policy
    }

    /// Forward a call to the instance named in its metadata
    pub async fn unary(&self, ctx: &CallContext, payload: Bytes) -> Result<Bytes> {
        let target = ctx
            .metadata
            .target
            .as_deref()
            .ok_or_else(|| PassthroughError::not_found("<no target>"))?;

        let call = async {
            let client = self.cache.create_client::<Raw>(target).await?;
            client.unary(&ctx.method, &ctx.metadata, payload).await
        };
        let result = bounded(ctx, self.config.call_timeout, call).await;
        if let Err(e) = &result {
            debug!(method = %ctx.method, target = %target, error = %e, "Unary call failed");
        }
        result
    }

    /// Deliver a call to every live instance of `service_type`
    ///
    /// Per-instance failures are reported, not returned. Zero live instances
    /// of a required feature fails with `Unavailable`.
    pub async fn broadcast(
        &self,
        service_type: &str,
        feature: &str,
        ctx: &CallContext,
        payload: Bytes,
    ) -> Result<BroadcastReport> {
        let required = self.policy.is_required(feature);
        let resolved = self.cache.resolve_type(service_type).await;
        if resolved.is_empty() {
            return self.no_instances(service_type, feature, &ctx.method, required);
        }

        let attempted = resolved.len();
        let deliveries = stream::iter(resolved)
            .map(|(entry, handle)| {
                let payload = payload.clone();
                async move {
                    let result = self.deliver(ctx, handle, payload).await;
                    (entry.unique_name, result)
                }
            })
            .buffer_unordered(self.config.max_fanout_concurrency.max(1))
            .collect::<Vec<_>>();

        let outcomes = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(PassthroughError::Cancelled),
            outcomes = deliveries => outcomes,
        };

        let mut report = BroadcastReport {
            attempted,
            ..Default::default()
        };
        for (unique_name, result) in outcomes {
            match result {
                Ok(_) => report.delivered += 1,
                Err(error) => {
                    warn!(
                        method = %ctx.method,
                        service_type = %service_type,
                        unique_name = %unique_name,
                        error = %error,
                        "Broadcast delivery failed"
                    );
                    report.failures.push(InstanceFailure { unique_name, error });
                }
            }
        }

        if required && self.policy.require_delivery() && report.all_failed() {
            warn!(
                method = %ctx.method,
                service_type = %service_type,
                feature = %feature,
                attempted,
                "Required broadcast reached no instance"
            );
            return Err(PassthroughError::unavailable(service_type));
        }

        debug!(
            method = %ctx.method,
            service_type = %service_type,
            attempted = report.attempted,
            delivered = report.delivered,
            "Broadcast complete"
        );
        Ok(report)
    }

    /// Merge the server streams of every live instance into `sink`
    ///
    /// Items from one instance keep their order; items from different
    /// instances interleave as they arrive.
    pub async fn server_stream_merge<S: OutboundSink>(
        &self,
        service_type: &str,
        feature: &str,
        ctx: &CallContext,
        payload: Bytes,
        sink: S,
    ) -> Result<MergeReport> {
        let required = self.policy.is_required(feature);
        let resolved = self.cache.resolve_type(service_type).await;
        if resolved.is_empty() {
            return self
                .no_instances(service_type, feature, &ctx.method, required)
                .map(|_| MergeReport::default());
        }

        let instances = resolved.len();
        let concurrency = self.config.max_fanout_concurrency.max(1);
        if instances > concurrency {
            warn!(
                method = %ctx.method,
                service_type = %service_type,
                instances,
                concurrency,
                "Merge has more instances than its concurrency bound"
            );
        }
        let (writer, writer_task) = SingleWriter::spawn(sink, self.config.merge_buffer);

        let relays = stream::iter(resolved)
            .map(|(entry, handle)| {
                let writer = writer.clone();
                let payload = payload.clone();
                async move {
                    let result = self.relay_instance(ctx, handle, payload, &writer).await;
                    (entry.unique_name, result)
                }
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>();

        let limit = self.config.stream_timeout;
        let outcomes = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                writer_task.abort();
                debug!(method = %ctx.method, service_type = %service_type, "Merge cancelled");
                return Err(PassthroughError::Cancelled);
            }
            outcomes = tokio::time::timeout(limit, relays) => match outcomes {
                Ok(outcomes) => outcomes,
                Err(_) => {
                    writer_task.abort();
                    return Err(PassthroughError::Timeout(limit));
                }
            },
        };

        drop(writer);
        let items = writer_task
            .await
            .map_err(|e| PassthroughError::transport(format!("outbound writer failed: {}", e)))??;

        let mut report = MergeReport {
            instances,
            items,
            ..Default::default()
        };
        for (unique_name, result) in outcomes {
            if let Err(error) = result {
                warn!(
                    method = %ctx.method,
                    service_type = %service_type,
                    unique_name = %unique_name,
                    error = %error,
                    "Merge source failed"
                );
                report.failures.push(InstanceFailure { unique_name, error });
            }
        }

        if required && self.policy.require_delivery() && report.failures.len() == instances {
            return Err(PassthroughError::unavailable(service_type));
        }

        debug!(
            method = %ctx.method,
            service_type = %service_type,
            instances,
            items,
            failed = report.failures.len(),
            "Merge complete"
        );
        Ok(report)
    }

    /// Relay a client-streaming or duplex call to the target of its first item
    ///
    /// Fails with `NotFound` after reading only the first item when that
    /// item names no live instance.
    pub async fn relay<S: OutboundSink>(
        &self,
        ctx: &CallContext,
        mode: RelayMode,
        mut inbound: ItemStream,
        sink: &mut S,
    ) -> Result<RelaySummary> {
        let first = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(PassthroughError::Cancelled),
            first = inbound.next() => first,
        };
        let first = first.ok_or_else(|| PassthroughError::not_found("<empty stream>"))?;
        let target = first
            .target
            .clone()
            .or_else(|| ctx.metadata.target.clone())
            .ok_or_else(|| PassthroughError::not_found("<no target>"))?;

        let client = self.cache.create_client::<Raw>(&target).await?;
        let metadata = ctx.metadata.clone().with_target(target.clone());
        let StreamingCall {
            sender,
            mut responses,
        } = client.open_stream(&ctx.method, &metadata, mode.kind()).await?;

        let forwarded = AtomicU64::new(0);
        let forwarded_ref = &forwarded;
        let forward = async move {
            if sender.send(first).await.is_err() {
                return;
            }
            forwarded_ref.fetch_add(1, Ordering::Relaxed);
            while let Some(item) = inbound.next().await {
                if sender.send(item).await.is_err() {
                    break;
                }
                forwarded_ref.fetch_add(1, Ordering::Relaxed);
            }
            // Dropping the sender half-closes the outbound call
        };
        let drain = async {
            let mut written = 0u64;
            while let Some(response) = responses.next().await {
                sink.write(response?).await?;
                written += 1;
            }
            Ok::<u64, PassthroughError>(written)
        };

        let relayed = async move {
            tokio::pin!(forward);
            tokio::pin!(drain);
            let mut forwarding = true;
            loop {
                tokio::select! {
                    _ = &mut forward, if forwarding => forwarding = false,
                    written = &mut drain => break written,
                }
            }
        };
        let responses = bounded(ctx, self.config.stream_timeout, relayed).await?;

        if mode == RelayMode::ClientStream && responses != 1 {
            return Err(PassthroughError::protocol(format!(
                "client-stream call '{}' returned {} responses",
                ctx.method, responses
            )));
        }

        let summary = RelaySummary {
            target,
            forwarded: forwarded.load(Ordering::Relaxed),
            responses,
        };
        debug!(
            method = %ctx.method,
            target = %summary.target,
            forwarded = summary.forwarded,
            responses = summary.responses,
            "Relay complete"
        );
        Ok(summary)
    }

    /// Queue a fire-and-forget push on every live instance of a type
    ///
    /// Returns how many instances accepted it.
    pub async fn notify_all(&self, service_type: &str, method: &str, payload: Bytes) -> usize {
        let handles = self.cache.get_channels_by_type(service_type).await;
        let queued = handles
            .iter()
            .filter(|handle| match handle.notify(method, payload.clone()) {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        unique_name = %handle.unique_name(),
                        method = %method,
                        error = %e,
                        "Notification not queued"
                    );
                    false
                }
            })
            .count();
        debug!(service_type = %service_type, method = %method, queued, "Notification fanned out");
        queued
    }

    fn no_instances(
        &self,
        service_type: &str,
        feature: &str,
        method: &str,
        required: bool,
    ) -> Result<BroadcastReport> {
        if required {
            warn!(
                method = %method,
                service_type = %service_type,
                feature = %feature,
                "No live instance for required feature"
            );
            return Err(PassthroughError::unavailable(service_type));
        }
        info!(
            method = %method,
            service_type = %service_type,
            "No live instance, nothing delivered"
        );
        Ok(BroadcastReport::default())
    }

    async fn deliver(
        &self,
        ctx: &CallContext,
        handle: Result<Arc<ChannelHandle>>,
        payload: Bytes,
    ) -> Result<Bytes> {
        let client = self.cache.client_for::<Raw>(handle?)?;
        bounded(
            ctx,
            self.config.call_timeout,
            client.unary(&ctx.method, &ctx.metadata, payload),
        )
        .await
    }

    async fn relay_instance(
        &self,
        ctx: &CallContext,
        handle: Result<Arc<ChannelHandle>>,
        payload: Bytes,
        writer: &WriterHandle,
    ) -> Result<u64> {
        let client = self.cache.client_for::<Raw>(handle?)?;
        let mut responses = client
            .server_stream(&ctx.method, &ctx.metadata, payload)
            .await?;

        let mut relayed = 0u64;
        while let Some(item) = responses.next().await {
            writer.send(item?).await?;
            relayed += 1;
        }
        Ok(relayed)
    }
}

/// Run `call` under the context's cancellation and a time limit
async fn bounded<T, F>(ctx: &CallContext, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(PassthroughError::Cancelled),
        result = tokio::time::timeout(limit, call) => {
            result.unwrap_or(Err(PassthroughError::Timeout(limit)))
        }
    }
}
