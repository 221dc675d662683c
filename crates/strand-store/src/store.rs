//! The local timeline store
//!
//! Owns every timeline hosted by one Store, hands out per-store sequence
//! numbers and enforces the store's message-slot capacity.
//!
//! # Locking
//!
//! - `timelines` (map) is held only long enough to look up or insert a handle,
//!   except by `delete_timeline`, which keeps it until the timeline's files
//!   are gone so a concurrent create cannot write a metadata file the delete
//!   then removes. Nothing takes the map while holding a timeline lock.
//! - Each timeline has its own `RwLock`; appends that touch several timelines
//!   take the write locks in sorted key order before a sequence number is
//!   assigned, so every timeline sees strictly increasing sequence numbers.
//! - `blocks`, `checkpoints` and `seq_mark` are leaf locks.
//!
//! # Sequence numbers
//!
//! The counter is restored on open from the larger of `store.json` and the
//! highest sequence number of any surviving timeline. `store.json` is
//! rewritten before a timeline is deleted and on `flush`, so deleting the
//! timeline holding the highest number never lets that number be issued
//! again.
//!
//! All locks are `parking_lot` and never held across `.await`.

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strand_core::{
    AppendReceipt, AppendRequest, BlockId, BlockPlacement, BlockSnapshot, HealthReport,
    HealthStatus, Message, MessageCursor, MessageQuery, Result, SeqId, SharedClock, StoreConfig,
    StoreId, StoreStats, StrandError, SystemClock, TimelineInfo, TimelineKey,
};

use crate::block::{block_path, BlockStorage, BLOCK_DIR};
use crate::checkpoint::Checkpoints;
use crate::meta::{StoreMeta, TimelineMeta, META_EXTENSION};
use crate::timeline::Timeline;

/// Capacity ratio at which a store reports itself degraded
const DEGRADED_CAPACITY_RATIO: f64 = 0.9;

type TimelineHandle = Arc<RwLock<Timeline>>;

/// Durable, block-structured append log for the timelines of one Store
pub struct TimelineStore {
    config: StoreConfig,
    store_id: StoreId,
    storage: BlockStorage,
    clock: SharedClock,
    timelines: RwLock<HashMap<TimelineKey, TimelineHandle>>,
    /// Owning timeline of every live block
    blocks: RwLock<HashMap<BlockId, TimelineKey>>,
    checkpoints: Mutex<Checkpoints>,
    seq: AtomicU64,
    /// Value last written to `store.json`
    seq_mark: Mutex<SeqId>,
    capacity: AtomicU64,
}

impl std::fmt::Debug for TimelineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineStore")
            .field("store_id", &self.store_id)
            .field("data_dir", &self.config.data_dir)
            .finish_non_exhaustive()
    }
}

impl TimelineStore {
    /// Open (or initialize) the store in `config.data_dir`
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with_clock(config, SystemClock::shared())
    }

    /// Open with an explicit clock
    pub fn open_with_clock(config: StoreConfig, clock: SharedClock) -> Result<Self> {
        if config.timeline_max_size == 0 {
            return Err(StrandError::invalid("timeline_max_size must be greater than 0"));
        }
        std::fs::create_dir_all(config.data_dir.join(BLOCK_DIR))?;

        let store_id = StoreId::new(config.store_id.clone());
        let storage = BlockStorage {
            dir: config.data_dir.clone(),
            store_id: store_id.clone(),
            mode: config.durability,
            max_size: config.timeline_max_size,
        };
        let checkpoints = Checkpoints::open(&config.data_dir)?;

        let store = Self {
            store_id,
            storage,
            clock,
            timelines: RwLock::new(HashMap::new()),
            blocks: RwLock::new(HashMap::new()),
            checkpoints: Mutex::new(checkpoints),
            seq: AtomicU64::new(0),
            seq_mark: Mutex::new(0),
            capacity: AtomicU64::new(0),
            config,
        };
        store.rehydrate()?;
        Ok(store)
    }

    fn rehydrate(&self) -> Result<()> {
        let now = self.clock.now_ms();
        let mut timelines = self.timelines.write();
        let mut blocks = self.blocks.write();
        let persisted = StoreMeta::load(&self.config.data_dir)?.last_seq_id;
        let mut used = 0;
        let mut last_seq = persisted;

        for path in meta_files(&self.config.data_dir)? {
            let meta = TimelineMeta::load(&path)?;
            let timeline = Timeline::load(&meta, &self.storage, now)?;
            used += timeline.message_count();
            last_seq = last_seq.max(timeline.last_seq_id());
            for block_id in timeline.block_ids() {
                blocks.insert(block_id, timeline.key().clone());
            }
            timelines.insert(timeline.key().clone(), Arc::new(RwLock::new(timeline)));
        }

        self.capacity.store(used, Ordering::SeqCst);
        self.seq.store(last_seq, Ordering::SeqCst);
        *self.seq_mark.lock() = persisted;
        tracing::info!(
            store = %self.store_id,
            timelines = timelines.len(),
            blocks = blocks.len(),
            capacity = used,
            last_seq_id = last_seq,
            "store opened"
        );
        Ok(())
    }

    /// Identifier of this store
    pub fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    /// Configuration the store was opened with
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Data directory of this store
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    // =========================================================================
    // Timelines
    // =========================================================================

    /// Return the timeline, creating it with an open block on first access
    pub fn get_or_create_timeline(&self, key: &TimelineKey) -> Result<TimelineInfo> {
        let handle = self.handle(key, true)?;
        let timeline = handle.read();
        timeline.ensure_live()?;
        Ok(timeline.info(&self.store_id))
    }

    /// Create a timeline; an existing timeline is returned unchanged
    pub fn create_timeline(&self, key: &TimelineKey) -> Result<TimelineInfo> {
        self.get_or_create_timeline(key)
    }

    /// Summary of an existing timeline
    pub fn get_timeline(&self, key: &TimelineKey) -> Result<TimelineInfo> {
        let handle = self.handle(key, false)?;
        let timeline = handle.read();
        timeline.ensure_live()?;
        Ok(timeline.info(&self.store_id))
    }

    /// Whether the store hosts the timeline
    pub fn contains(&self, key: &TimelineKey) -> bool {
        self.timelines.read().contains_key(key)
    }

    /// Delete a timeline and all of its blocks, freeing its capacity
    pub fn delete_timeline(&self, key: &TimelineKey) -> Result<()> {
        let mut timelines = self.timelines.write();
        let handle = timelines
            .get(key)
            .cloned()
            .ok_or_else(|| StrandError::not_found(format!("timeline {key}")))?;
        let mut timeline = handle.write();
        self.persist_seq_mark()?;
        let removed = timeline.remove(&self.storage);
        timelines.remove(key);
        drop(timelines);
        let freed = removed?;
        {
            let mut blocks = self.blocks.write();
            for block_id in timeline.block_ids() {
                blocks.remove(&block_id);
            }
        }
        self.release(freed);
        tracing::info!(store = %self.store_id, key = %key, freed, "timeline deleted");
        Ok(())
    }

    fn handle(&self, key: &TimelineKey, create: bool) -> Result<TimelineHandle> {
        if let Some(handle) = self.timelines.read().get(key) {
            return Ok(handle.clone());
        }
        if !create {
            return Err(StrandError::not_found(format!("timeline {key}")));
        }
        key.validate()?;

        let mut timelines = self.timelines.write();
        if let Some(handle) = timelines.get(key) {
            return Ok(handle.clone());
        }
        let timeline = Timeline::create(
            key.clone(),
            &self.storage,
            self.capacity.load(Ordering::SeqCst),
            self.clock.now_ms(),
        )?;
        {
            let mut blocks = self.blocks.write();
            for block_id in timeline.block_ids() {
                blocks.insert(block_id, key.clone());
            }
        }
        let handle = Arc::new(RwLock::new(timeline));
        timelines.insert(key.clone(), handle.clone());
        tracing::info!(store = %self.store_id, key = %key, "timeline created");
        Ok(handle)
    }

    // =========================================================================
    // Appends
    // =========================================================================

    /// Assign the next sequence number and append the message to the primary
    /// timeline and every fan-out timeline, creating them as needed.
    ///
    /// Capacity for every copy is reserved up front. If a copy fails after
    /// others were written the result is `PartialFailure`; the remaining
    /// timelines can be completed with [`TimelineStore::replay_fanout`].
    pub fn add_message(&self, request: AppendRequest) -> Result<AppendReceipt> {
        let targets = request.targets();
        let handles = targets
            .iter()
            .map(|key| self.handle(key, true))
            .collect::<Result<Vec<_>>>()?;
        let mut guards = lock_sorted(&targets, &handles);
        for guard in &guards {
            guard.ensure_live()?;
        }

        self.reserve(targets.len() as u64)?;
        let message = Message {
            seq_id: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            timeline_key: request.timeline_key,
            sender_id: request.sender_id,
            create_time: self.clock.now_ms(),
            data: request.data,
        };

        let mut placements = Vec::with_capacity(targets.len());
        let mut failed = Vec::new();
        let mut first_error = None;
        for (key, guard) in targets.iter().zip(guards.iter_mut()) {
            match self.append_locked(guard, message.clone()) {
                Ok(placement) => placements.push(placement),
                Err(e) => {
                    self.release(1);
                    tracing::warn!(
                        store = %self.store_id,
                        key = %key,
                        seq_id = message.seq_id,
                        error = %e,
                        "fan-out append failed"
                    );
                    failed.push(format!("{key}: {e}"));
                    first_error.get_or_insert(e);
                }
            }
        }
        drop(guards);

        if let Some(error) = first_error {
            if placements.is_empty() {
                return Err(error);
            }
            return Err(StrandError::partial_failure(
                format!("add_message seq {}", message.seq_id),
                placements.iter().map(|p| p.timeline_key.to_string()).collect(),
                failed,
            ));
        }

        tracing::debug!(
            store = %self.store_id,
            key = %message.timeline_key,
            seq_id = message.seq_id,
            copies = placements.len(),
            "message appended"
        );
        Ok(AppendReceipt {
            message,
            placements,
        })
    }

    /// Re-apply an already sequenced message to the given timelines.
    ///
    /// Timelines that already hold the sequence number are skipped, so the
    /// call can be repeated until it succeeds.
    pub fn replay_fanout(&self, message: &Message, keys: &[TimelineKey]) -> Result<Vec<BlockPlacement>> {
        let mut targets = keys.to_vec();
        targets.sort();
        targets.dedup();
        let handles = targets
            .iter()
            .map(|key| self.handle(key, true))
            .collect::<Result<Vec<_>>>()?;
        let mut guards = lock_sorted(&targets, &handles);

        let pending: Vec<usize> = guards
            .iter()
            .enumerate()
            .filter(|(_, g)| !g.is_deleted() && g.last_seq_id() < message.seq_id)
            .map(|(i, _)| i)
            .collect();
        self.reserve(pending.len() as u64)?;
        self.seq.fetch_max(message.seq_id, Ordering::SeqCst);

        let mut placements = Vec::with_capacity(pending.len());
        for (n, index) in pending.iter().enumerate() {
            match self.append_locked(&mut guards[*index], message.clone()) {
                Ok(placement) => placements.push(placement),
                Err(e) => {
                    self.release((pending.len() - n) as u64);
                    return Err(e);
                }
            }
        }
        tracing::debug!(
            store = %self.store_id,
            seq_id = message.seq_id,
            replayed = placements.len(),
            skipped = targets.len() - placements.len(),
            "fan-out replayed"
        );
        Ok(placements)
    }

    /// Append migrated messages to a timeline, keeping their sequence numbers.
    ///
    /// Messages at or below the timeline's high-water mark are skipped, which
    /// makes a retried batch harmless.
    pub fn import_messages(&self, key: &TimelineKey, mut messages: Vec<Message>) -> Result<TimelineInfo> {
        let handle = self.handle(key, true)?;
        let mut timeline = handle.write();
        timeline.ensure_live()?;

        messages.sort_by_key(|m| m.seq_id);
        messages.dedup_by_key(|m| m.seq_id);
        messages.retain(|m| m.seq_id > timeline.last_seq_id());
        let count = messages.len() as u64;
        self.reserve(count)?;

        let mut imported = 0;
        for message in messages {
            let seq_id = message.seq_id;
            if let Err(e) = self.append_locked(&mut timeline, message) {
                self.release(count - imported);
                return Err(e);
            }
            imported += 1;
            self.seq.fetch_max(seq_id, Ordering::SeqCst);
        }
        timeline.persist(&self.storage)?;
        tracing::debug!(store = %self.store_id, key = %key, imported, "messages imported");
        Ok(timeline.info(&self.store_id))
    }

    fn append_locked(&self, timeline: &mut Timeline, message: Message) -> Result<BlockPlacement> {
        let placement = timeline.append(
            &self.storage,
            message,
            self.capacity.load(Ordering::SeqCst),
            self.clock.now_ms(),
        )?;
        if placement.new_block {
            self.blocks
                .write()
                .insert(placement.block.block_id, timeline.key().clone());
        }
        Ok(placement)
    }

    fn reserve(&self, slots: u64) -> Result<()> {
        let max = self.config.max_capacity;
        self.capacity
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(slots).filter(|next| *next <= max)
            })
            .map(|_| ())
            .map_err(|used| StrandError::capacity_exceeded(self.store_id.as_str(), used, max))
    }

    fn release(&self, slots: u64) {
        let _ = self
            .capacity
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(slots))
            });
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Paginated read of one timeline
    pub fn get_messages(&self, key: &TimelineKey, query: MessageQuery) -> Result<Vec<Message>> {
        let handle = self.handle(key, false)?;
        let timeline = handle.read();
        timeline.ensure_live()?;
        Ok(timeline.messages(query))
    }

    /// Paginated read of a conversation timeline
    pub fn get_conv_messages(&self, conv_id: &str, limit: usize, cursor: MessageCursor) -> Result<Vec<Message>> {
        self.get_messages(&TimelineKey::conversation(conv_id), MessageQuery { limit, cursor })
    }

    /// Paginated read of a user's inbox timeline
    pub fn get_inbox_messages(&self, user_id: &str, limit: usize, cursor: MessageCursor) -> Result<Vec<Message>> {
        self.get_messages(&TimelineKey::inbox(user_id), MessageQuery { limit, cursor })
    }

    /// Metadata and contents of one block
    pub fn get_block(&self, block_id: &BlockId) -> Result<BlockSnapshot> {
        let key = self
            .blocks
            .read()
            .get(block_id)
            .cloned()
            .ok_or_else(|| StrandError::not_found(format!("block {block_id}")))?;
        let handle = self.handle(&key, false)?;
        let timeline = handle.read();
        timeline
            .block(block_id)
            .map(|block| block.snapshot(&key))
            .ok_or_else(|| StrandError::not_found(format!("block {block_id}")))
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Last sequence number a user has read; 0 when never set
    pub fn get_checkpoint(&self, user_id: &str) -> SeqId {
        self.checkpoints.lock().get(user_id)
    }

    /// Advance a user's checkpoint; moving it backwards is rejected
    pub fn update_checkpoint(&self, user_id: &str, seq_id: SeqId) -> Result<()> {
        if self.checkpoints.lock().update(user_id, seq_id)? {
            tracing::debug!(store = %self.store_id, user = user_id, seq_id, "checkpoint advanced");
        }
        Ok(())
    }

    // =========================================================================
    // Introspection and durability
    // =========================================================================

    /// Capacity and content counters
    pub fn stats(&self) -> StoreStats {
        let handles: Vec<TimelineHandle> = self.timelines.read().values().cloned().collect();
        let mut block_count = 0;
        let mut message_count = 0;
        for handle in &handles {
            let timeline = handle.read();
            block_count += timeline.block_count() as u64;
            message_count += timeline.message_count();
        }
        StoreStats {
            store_id: self.store_id.clone(),
            timeline_count: handles.len() as u64,
            block_count,
            message_count,
            current_capacity: self.capacity.load(Ordering::SeqCst),
            max_capacity: self.config.max_capacity,
            max_timelines: self.config.max_timelines,
            last_seq_id: self.seq.load(Ordering::SeqCst),
        }
    }

    /// Health derived from the data directory and capacity usage
    pub fn health(&self) -> HealthReport {
        let stats = self.stats();
        let (status, message) = if !self.config.data_dir.join(BLOCK_DIR).is_dir() {
            (HealthStatus::Unhealthy, "data directory is missing".to_string())
        } else if stats.capacity_ratio() >= DEGRADED_CAPACITY_RATIO {
            (
                HealthStatus::Degraded,
                format!("capacity {:.0}% used", stats.capacity_ratio() * 100.0),
            )
        } else {
            (HealthStatus::Healthy, "ok".to_string())
        };
        HealthReport {
            store_id: self.store_id.clone(),
            status,
            message,
            checked_at: self.clock.now_ms(),
        }
    }

    /// Persist every open block and metadata file
    pub fn flush(&self) -> Result<()> {
        let handles: Vec<TimelineHandle> = self.timelines.read().values().cloned().collect();
        for handle in handles {
            handle.read().persist(&self.storage)?;
        }
        self.persist_seq_mark()?;
        tracing::debug!(store = %self.store_id, "store flushed");
        Ok(())
    }

    /// Record the sequence counter in `store.json` if it moved since the last write
    fn persist_seq_mark(&self) -> Result<()> {
        let mut mark = self.seq_mark.lock();
        let current = self.seq.load(Ordering::SeqCst);
        if current > *mark {
            StoreMeta {
                last_seq_id: current,
            }
            .save(&self.config.data_dir)?;
            *mark = current;
        }
        Ok(())
    }

    /// Path of a block file
    pub fn block_file(&self, block_id: &BlockId) -> PathBuf {
        block_path(&self.config.data_dir, block_id)
    }
}

/// Take write locks on `handles` in ascending key order; guards are returned
/// in the order of `keys`.
fn lock_sorted<'a>(
    keys: &[TimelineKey],
    handles: &'a [TimelineHandle],
) -> Vec<RwLockWriteGuard<'a, Timeline>> {
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by(|a, b| keys[*a].cmp(&keys[*b]));
    let mut slots: Vec<Option<RwLockWriteGuard<'a, Timeline>>> = keys.iter().map(|_| None).collect();
    for index in order {
        slots[index] = Some(handles[index].write());
    }
    slots.into_iter().flatten().collect()
}

fn meta_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(META_EXTENSION) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
