//! Transaction participant backed by a Store's `TimelineService`
//!
//! Prepare checks that the Store is serving and has room for the write, and
//! that a timeline being created is not already indexed on another Store.
//! Commit applies the operation and then brings the global index in line
//! with the resulting blocks. Once the Store has accepted a write, index
//! bookkeeping failures are logged rather than returned: the write cannot be
//! undone, and the index mutators are idempotent so a later sync converges.

use async_trait::async_trait;
use std::sync::Arc;

use strand_coordination::{
    GlobalIndexManager, IndexChange, IndexEntry, Operation, ParticipantHandler,
    ParticipantOutcome, TransactionId,
};
use strand_core::{
    BlockPlacement, HealthStatus, Result, StoreId, StoreStats, StrandError, TimelineKey,
    TimelineService,
};

/// [`ParticipantHandler`] for one Store
pub struct StoreParticipant {
    service: Arc<dyn TimelineService>,
    index: Arc<GlobalIndexManager>,
}

impl StoreParticipant {
    /// Participant driving `service` and keeping `index` current
    pub fn new(service: Arc<dyn TimelineService>, index: Arc<GlobalIndexManager>) -> Self {
        Self { service, index }
    }

    fn store_id(&self) -> &StoreId {
        self.service.store_id()
    }

    async fn serving_stats(&self) -> Result<StoreStats> {
        let health = self.service.health().await?;
        if health.status == HealthStatus::Unhealthy {
            return Err(StrandError::unavailable(format!(
                "store {} is unhealthy: {}",
                self.store_id(),
                health.message
            )));
        }
        self.service.stats().await
    }

    fn ensure_slots(stats: &StoreStats, slots: u64) -> Result<()> {
        if stats.current_capacity.saturating_add(slots) > stats.max_capacity {
            return Err(StrandError::capacity_exceeded(
                stats.store_id.as_str(),
                stats.current_capacity,
                stats.max_capacity,
            ));
        }
        Ok(())
    }

    fn ensure_timeline_room(stats: &StoreStats) -> Result<()> {
        if stats.timeline_count >= stats.max_timelines {
            return Err(StrandError::capacity_exceeded(
                stats.store_id.as_str(),
                stats.timeline_count,
                stats.max_timelines,
            ));
        }
        Ok(())
    }

    /// A timeline the index places on another Store cannot be created here
    fn ensure_unclaimed(&self, key: &TimelineKey) -> Result<()> {
        match self.index.store_of(key) {
            Some(owner) if owner != *self.store_id() => Err(StrandError::already_exists(
                format!("{key} is hosted on {owner}"),
            )),
            _ => Ok(()),
        }
    }

    fn index_placements(&self, placements: &[BlockPlacement]) {
        for placement in placements {
            let entry = IndexEntry::for_block(&placement.timeline_key, &placement.block);
            let result = if placement.new_block {
                self.index.add_index(entry)
            } else {
                match self.index.update_index(entry.clone()) {
                    // First write to a timeline the Store created on demand
                    Err(StrandError::NotFound { .. }) => self.index.add_index(entry),
                    other => other,
                }
            };
            self.log_index_result(&placement.timeline_key.to_string(), result);
        }
    }

    fn log_index_result(&self, key: &str, result: Result<IndexChange>) {
        if let Err(err) = result {
            tracing::warn!(
                store = %self.store_id(),
                key,
                error = %err,
                "index out of step with store after commit"
            );
        }
    }
}

#[async_trait]
impl ParticipantHandler for StoreParticipant {
    async fn prepare(&self, txn: TransactionId, operation: &Operation) -> Result<()> {
        tracing::trace!(txn = %txn, store = %self.store_id(), op = operation.name(), "prepare");
        match operation {
            Operation::CreateTimeline { key } => {
                key.validate()?;
                self.ensure_unclaimed(key)?;
                let stats = self.serving_stats().await?;
                match self.service.get_timeline(key).await {
                    Ok(_) => Ok(()),
                    Err(StrandError::NotFound { .. }) => Self::ensure_timeline_room(&stats),
                    Err(err) => Err(err),
                }
            }
            Operation::AddMessage { request } | Operation::AppendFanout { request } => {
                let targets = request.targets();
                for key in &targets {
                    key.validate()?;
                }
                let stats = self.serving_stats().await?;
                Self::ensure_slots(&stats, targets.len() as u64)
            }
            Operation::DeleteTimeline { key } => self.service.get_timeline(key).await.map(|_| ()),
            Operation::MigrateTimeline { key, source, target } => {
                if self.store_id() == source {
                    self.service.get_timeline(key).await.map(|_| ())
                } else if self.store_id() == target {
                    let stats = self.serving_stats().await?;
                    Self::ensure_timeline_room(&stats)
                } else {
                    Err(StrandError::invalid(format!(
                        "store {} takes no part in migrating {key}",
                        self.store_id()
                    )))
                }
            }
        }
    }

    async fn commit(&self, txn: TransactionId, operation: &Operation) -> Result<ParticipantOutcome> {
        tracing::trace!(txn = %txn, store = %self.store_id(), op = operation.name(), "commit");
        match operation {
            Operation::CreateTimeline { key } => {
                self.ensure_unclaimed(key)?;
                let info = self.service.create_timeline(key).await?;
                let result = self.index.register_timeline(key, self.store_id());
                self.log_index_result(&key.to_string(), result);
                for entry in IndexEntry::for_timeline(&info) {
                    let result = self.index.add_index(entry);
                    self.log_index_result(&key.to_string(), result);
                }
                tracing::info!(store = %self.store_id(), key = %key, "timeline created");
                Ok(ParticipantOutcome::Timeline(info))
            }
            Operation::AddMessage { request } | Operation::AppendFanout { request } => {
                let receipt = self.service.add_message(request.clone()).await?;
                self.index_placements(&receipt.placements);
                Ok(ParticipantOutcome::Appended(receipt))
            }
            Operation::DeleteTimeline { key } => {
                self.service.delete_timeline(key).await?;
                let result = self.index.remove_index(key);
                self.log_index_result(&key.to_string(), result);
                tracing::info!(store = %self.store_id(), key = %key, "timeline deleted");
                Ok(ParticipantOutcome::Done)
            }
            // Data movement runs in the migration pipeline
            Operation::MigrateTimeline { .. } => Ok(ParticipantOutcome::Done),
        }
    }

    async fn abort(&self, txn: TransactionId, operation: &Operation) -> Result<()> {
        // Prepare holds no Store-side state
        tracing::trace!(txn = %txn, store = %self.store_id(), op = operation.name(), "abort");
        Ok(())
    }
}
