//! Store-facing service interface
//!
//! `TimelineService` is the seam between the coordination layer and a Store.
//! The local implementation lives in `strand-store`; the remote one in
//! `strand-rpc` speaks the cross-store wire protocol. Coordinators only ever
//! hold `Arc<dyn TimelineService>` and do not know which side of the network
//! a Store is on.

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{
    AppendReceipt, AppendRequest, BlockId, BlockSnapshot, HealthReport, Message, MessageQuery,
    StoreId, StoreStats, TimelineInfo, TimelineKey,
};

/// Operations a Store exposes to coordinators
#[async_trait]
pub trait TimelineService: Send + Sync {
    /// Identifier of the store behind this service
    fn store_id(&self) -> &StoreId;

    /// Summary of an existing timeline
    async fn get_timeline(&self, key: &TimelineKey) -> Result<TimelineInfo>;

    /// Create a timeline with an open block; existing timelines are returned as-is
    async fn create_timeline(&self, key: &TimelineKey) -> Result<TimelineInfo>;

    /// Remove a timeline and all of its blocks
    async fn delete_timeline(&self, key: &TimelineKey) -> Result<()>;

    /// Assign the next sequence number and append to the primary and fan-out timelines
    async fn add_message(&self, request: AppendRequest) -> Result<AppendReceipt>;

    /// Paginated read
    async fn get_messages(&self, key: &TimelineKey, query: MessageQuery) -> Result<Vec<Message>>;

    /// Append migrated messages, keeping their sequence numbers
    async fn import_messages(&self, key: &TimelineKey, messages: Vec<Message>)
        -> Result<TimelineInfo>;

    /// Metadata and contents of one block
    async fn get_block(&self, block_id: &BlockId) -> Result<BlockSnapshot>;

    /// Capacity and content counters
    async fn stats(&self) -> Result<StoreStats>;

    /// Liveness and health
    async fn health(&self) -> Result<HealthReport>;
}
