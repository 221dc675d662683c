//! `TimelineService` over a local [`TimelineStore`]
//!
//! Store calls do blocking file I/O, so each one runs on tokio's blocking
//! pool.

use async_trait::async_trait;
use std::sync::Arc;

use strand_core::{
    AppendReceipt, AppendRequest, BlockId, BlockSnapshot, HealthReport, Message, MessageQuery,
    Result, StoreId, StoreStats, StrandError, TimelineInfo, TimelineKey, TimelineService,
};

use crate::store::TimelineStore;

/// A store served in-process
#[derive(Debug, Clone)]
pub struct LocalStore {
    store: Arc<TimelineStore>,
}

impl LocalStore {
    /// Wrap an opened store
    pub fn new(store: Arc<TimelineStore>) -> Self {
        Self { store }
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<TimelineStore> {
        &self.store
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&TimelineStore) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StrandError::internal(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl TimelineService for LocalStore {
    fn store_id(&self) -> &StoreId {
        self.store.store_id()
    }

    async fn get_timeline(&self, key: &TimelineKey) -> Result<TimelineInfo> {
        let key = key.clone();
        self.run(move |s| s.get_timeline(&key)).await
    }

    async fn create_timeline(&self, key: &TimelineKey) -> Result<TimelineInfo> {
        let key = key.clone();
        self.run(move |s| s.create_timeline(&key)).await
    }

    async fn delete_timeline(&self, key: &TimelineKey) -> Result<()> {
        let key = key.clone();
        self.run(move |s| s.delete_timeline(&key)).await
    }

    async fn add_message(&self, request: AppendRequest) -> Result<AppendReceipt> {
        self.run(move |s| s.add_message(request)).await
    }

    async fn get_messages(&self, key: &TimelineKey, query: MessageQuery) -> Result<Vec<Message>> {
        let key = key.clone();
        self.run(move |s| s.get_messages(&key, query)).await
    }

    async fn import_messages(
        &self,
        key: &TimelineKey,
        messages: Vec<Message>,
    ) -> Result<TimelineInfo> {
        let key = key.clone();
        self.run(move |s| s.import_messages(&key, messages)).await
    }

    async fn get_block(&self, block_id: &BlockId) -> Result<BlockSnapshot> {
        let block_id = *block_id;
        self.run(move |s| s.get_block(&block_id)).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.run(|s| Ok(s.stats())).await
    }

    async fn health(&self) -> Result<HealthReport> {
        self.run(|s| Ok(s.health())).await
    }
}
