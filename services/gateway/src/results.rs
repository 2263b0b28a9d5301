//! Results storage contract
//!
//! Reassembled uploads are stored on a Results backend through a typed
//! client built by the cache's client factories.

use async_trait::async_trait;
use bytes::Bytes;
use passthrough::{
    CallMetadata, ChannelCache, ChannelHandle, ClientFactories, Contract, PassthroughError,
    PayloadSink, RawClient, ReassembledPayload, Result,
};
use std::sync::Arc;
use tracing::info;

/// Backend method receiving a completed upload
pub const STORE_IMAGE_METHOD: &str = "Results/StoreImage";

pub const RESULTS_SERVICE_TYPE: &str = "Results";

/// Contract spoken by Results backends
#[derive(Debug)]
pub struct ResultsContract;

impl Contract for ResultsContract {
    const NAME: &'static str = "results";
    type Client = ResultsClient;
}

/// Typed client for one Results instance
#[derive(Debug, Clone)]
pub struct ResultsClient {
    raw: RawClient,
}

impl ResultsClient {
    pub fn new(handle: Arc<ChannelHandle>) -> Self {
        Self {
            raw: RawClient::new(handle),
        }
    }

    pub fn unique_name(&self) -> &str {
        self.raw.unique_name()
    }

    /// Store a reassembled payload; the backend's reply is returned as is
    pub async fn store_image(
        &self,
        metadata: &CallMetadata,
        payload: &ReassembledPayload,
    ) -> Result<Bytes> {
        let body = bincode::serialize(payload)?;
        self.raw
            .unary(STORE_IMAGE_METHOD, metadata, Bytes::from(body))
            .await
    }
}

/// Register the contracts the gateway speaks besides `Raw`
pub fn register_contracts(factories: &ClientFactories) {
    factories.register::<ResultsContract, _>(ResultsClient::new);
}

/// Payload sink writing to a Results backend
///
/// Uses the call's target when it names one, otherwise the first live
/// Results instance by unique name.
pub struct ResultsSink {
    cache: Arc<ChannelCache>,
    metadata: CallMetadata,
}

impl ResultsSink {
    pub fn new(cache: Arc<ChannelCache>, metadata: CallMetadata) -> Self {
        Self { cache, metadata }
    }

    async fn client(&self) -> Result<ResultsClient> {
        if let Some(target) = &self.metadata.target {
            return self.cache.create_client::<ResultsContract>(target).await;
        }
        let mut handles = self.cache.get_channels_by_type(RESULTS_SERVICE_TYPE).await;
        handles.sort_by(|a, b| a.unique_name().cmp(b.unique_name()));
        let handle = handles
            .into_iter()
            .next()
            .ok_or_else(|| PassthroughError::not_found(RESULTS_SERVICE_TYPE))?;
        self.cache.client_for::<ResultsContract>(handle)
    }
}

#[async_trait]
impl PayloadSink for ResultsSink {
    async fn store(&self, payload: ReassembledPayload) -> Result<Bytes> {
        let client = self.client().await?;
        info!(
            unique_name = %client.unique_name(),
            result_id = %payload.meta.result_id,
            bytes = payload.data.len(),
            "Storing reassembled upload"
        );
        client.store_image(&self.metadata, &payload).await
    }
}
