//! `TimelineService` backed by a remote Store
//!
//! [`RemoteStore`] turns each trait call into one `POST /rpc`. Transport
//! failures become `Network` (or `Timeout`); failures reported by the remote
//! Store come back as the same `StrandError` variant it raised.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use strand_core::time::duration_ms;
use strand_core::{
    AppendReceipt, AppendRequest, BlockId, BlockSnapshot, HealthReport, Message, MessageQuery,
    Result, RpcConfig, StoreId, StoreStats, StrandError, TimelineInfo, TimelineKey,
    TimelineService,
};

use crate::protocol::{
    BlockParams, MessagesParams, MigrateParams, RpcMethod, RpcRequest, RpcResponse,
    TimelineParams,
};

/// Client side of the wire protocol for one Store
#[derive(Debug, Clone)]
pub struct RemoteStore {
    store_id: StoreId,
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl RemoteStore {
    /// Client for the Store `store_id` served at `base_url`
    /// (e.g. `http://10.0.0.7:7400`)
    pub fn new(store_id: StoreId, base_url: impl Into<String>, config: &RpcConfig) -> Result<Self> {
        let timeout = config.request_timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StrandError::internal(format!("http client: {e}")))?;
        Ok(Self {
            store_id,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            timeout,
        })
    }

    /// Client for whichever Store answers at `base_url`
    pub async fn connect(base_url: impl Into<String>, config: &RpcConfig) -> Result<Self> {
        let mut remote = Self::new(StoreId::new(""), base_url, config)?;
        let stats: StoreStats = remote.call(RpcMethod::GetStoreStats, &()).await?;
        remote.store_id = stats.store_id;
        tracing::info!(store = %remote.store_id, url = %remote.base_url, "connected to remote store");
        Ok(remote)
    }

    /// Server address
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Liveness probe against `GET /health`
    pub async fn ping(&self) -> Result<HealthReport> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| transport_error("health", e))?;
        let envelope: RpcResponse = response
            .json()
            .await
            .map_err(|e| transport_error("health", e))?;
        envelope.into_result()
    }

    async fn call<P, R>(&self, method: RpcMethod, params: &P) -> Result<R>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let request = RpcRequest::new(method, params, duration_ms(self.timeout))?;
        tracing::trace!(method = %method, request_id = %request.request_id, url = %self.base_url, "rpc call");
        let response = self
            .client
            .post(format!("{}/rpc", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(&method.to_string(), e))?;
        let status = response.status();
        let envelope: RpcResponse = response.json().await.map_err(|e| {
            if status.is_success() {
                StrandError::serialization(format!("{method} response: {e}"))
            } else {
                StrandError::network(format!("{method} returned {status}"))
            }
        })?;
        if envelope.success && envelope.request_id != request.request_id {
            return Err(StrandError::network(format!(
                "{method} answered request {} instead of {}",
                envelope.request_id, request.request_id
            )));
        }
        envelope.into_result()
    }
}

fn transport_error(operation: &str, err: reqwest::Error) -> StrandError {
    if err.is_timeout() {
        StrandError::timeout(format!("{operation}: {err}"))
    } else {
        StrandError::network(format!("{operation}: {err}"))
    }
}

#[async_trait]
impl TimelineService for RemoteStore {
    fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    async fn get_timeline(&self, key: &TimelineKey) -> Result<TimelineInfo> {
        self.call(RpcMethod::GetTimeline, &TimelineParams { key: key.clone() })
            .await
    }

    async fn create_timeline(&self, key: &TimelineKey) -> Result<TimelineInfo> {
        self.call(RpcMethod::CreateTimeline, &TimelineParams { key: key.clone() })
            .await
    }

    async fn delete_timeline(&self, key: &TimelineKey) -> Result<()> {
        self.call(RpcMethod::DeleteTimeline, &TimelineParams { key: key.clone() })
            .await
    }

    async fn add_message(&self, request: AppendRequest) -> Result<AppendReceipt> {
        self.call(RpcMethod::AddMessage, &request).await
    }

    async fn get_messages(&self, key: &TimelineKey, query: MessageQuery) -> Result<Vec<Message>> {
        self.call(RpcMethod::GetMessages, &MessagesParams::new(key, query))
            .await
    }

    async fn import_messages(
        &self,
        key: &TimelineKey,
        messages: Vec<Message>,
    ) -> Result<TimelineInfo> {
        self.call(
            RpcMethod::MigrateTimeline,
            &MigrateParams {
                key: key.clone(),
                messages,
            },
        )
        .await
    }

    async fn get_block(&self, block_id: &BlockId) -> Result<BlockSnapshot> {
        self.call(
            RpcMethod::GetTimelineBlock,
            &BlockParams {
                block_id: *block_id,
            },
        )
        .await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.call(RpcMethod::GetStoreStats, &()).await
    }

    async fn health(&self) -> Result<HealthReport> {
        self.call(RpcMethod::HealthCheck, &()).await
    }
}
