//! # Global Index
//!
//! Store-independent directory of where every timeline's blocks live.
//!
//! A timeline is indexed from the moment its Store creates it, before it
//! has any blocks ([`GlobalIndexManager::register_timeline`]); every block
//! it later gains must live on that same Store.
//!
//! The mutators (`register_timeline`, `add_index`, `remove_index`,
//! `update_index`, `migrate_timeline`) are idempotent: re-applying a change that is already
//! in effect returns [`IndexChange::Unchanged`] instead of an error, so they
//! can be driven by at-least-once delivery.
//!
//! ## Watch delivery
//!
//! Each watcher owns a bounded queue. Notification is at-most-once: when a
//! watcher's queue is full the event is dropped, counted in
//! [`IndexWatcher::dropped`] and logged. [`GlobalIndexManager::shutdown`]
//! closes every queue; watchers drain what was queued and then see the end
//! of the stream. The closed flag is read and set under the subscriber lock,
//! so a `watch` racing `shutdown` either fails or has its queue closed.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use strand_core::{
    BlockId, BlockInfo, IndexConfig, Result, SharedClock, StoreId, StrandError, TimelineInfo,
    TimelineKey,
};

/// Location of one block of a timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    /// Timeline the block belongs to
    pub timeline_key: TimelineKey,
    /// Store hosting the block
    pub store_id: StoreId,
    /// Block identifier
    pub block_id: BlockId,
    /// Store capacity offset of the block
    pub offset: u64,
    /// Messages in the block
    pub size: u64,
    /// When the entry was first indexed, Unix milliseconds
    pub created_at: u64,
    /// Last change, Unix milliseconds
    pub updated_at: u64,
}

impl IndexEntry {
    /// Entry for a block as reported by its Store
    pub fn for_block(timeline_key: &TimelineKey, block: &BlockInfo) -> Self {
        Self {
            timeline_key: timeline_key.clone(),
            store_id: block.store_id.clone(),
            block_id: block.block_id,
            offset: block.offset,
            size: block.size,
            created_at: block.created_at,
            updated_at: block.created_at,
        }
    }

    /// Entries for every block of a timeline
    pub fn for_timeline(info: &TimelineInfo) -> Vec<Self> {
        info.blocks
            .iter()
            .map(|block| Self::for_block(&info.key, block))
            .collect()
    }
}

/// All known blocks of one timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineLocation {
    /// Timeline key
    pub key: TimelineKey,
    /// Hosting Store
    pub store_id: StoreId,
    /// Blocks in allocation order
    pub entries: Vec<IndexEntry>,
    /// Block ids grouped by hosting Store
    pub by_store: BTreeMap<StoreId, Vec<BlockId>>,
}

impl TimelineLocation {
    fn new(key: TimelineKey, store_id: StoreId) -> Self {
        Self {
            key,
            store_id,
            entries: Vec::new(),
            by_store: BTreeMap::new(),
        }
    }

    fn rebuild_by_store(&mut self) {
        self.by_store.clear();
        for entry in &self.entries {
            self.by_store
                .entry(entry.store_id.clone())
                .or_default()
                .push(entry.block_id);
        }
    }
}

/// Outcome of an index mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexChange {
    /// The index changed
    Applied,
    /// The change was already in effect
    Unchanged,
}

/// Index change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IndexEvent {
    /// The timeline was created on a Store
    Registered {
        /// New timeline
        key: TimelineKey,
        /// Hosting Store
        store_id: StoreId,
    },
    /// A block was indexed
    Added {
        /// The new entry
        entry: IndexEntry,
    },
    /// A block's size or offset changed
    Updated {
        /// The entry after the change
        entry: IndexEntry,
    },
    /// The timeline was removed
    Removed {
        /// Removed timeline
        key: TimelineKey,
    },
    /// The timeline moved to another Store
    Migrated {
        /// Migrated timeline
        key: TimelineKey,
        /// Previous Store
        from: StoreId,
        /// New Store
        to: StoreId,
    },
}

struct Subscriber {
    tx: mpsc::Sender<IndexEvent>,
    dropped: Arc<AtomicU64>,
}

/// Receiving end of a [`GlobalIndexManager::watch`] subscription.
///
/// Dropping the watcher cancels the subscription.
#[derive(Debug)]
pub struct IndexWatcher {
    key: TimelineKey,
    rx: mpsc::Receiver<IndexEvent>,
    dropped: Arc<AtomicU64>,
}

impl IndexWatcher {
    /// Watched timeline
    pub fn key(&self) -> &TimelineKey {
        &self.key
    }

    /// Next event; `None` once the index has shut down and the queue is empty
    pub async fn recv(&mut self) -> Option<IndexEvent> {
        self.rx.recv().await
    }

    /// Next event if one is queued
    pub fn try_recv(&mut self) -> Option<IndexEvent> {
        self.rx.try_recv().ok()
    }

    /// Events discarded because this watcher's queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Authoritative timeline location directory
pub struct GlobalIndexManager {
    locations: RwLock<HashMap<TimelineKey, TimelineLocation>>,
    store_timelines: RwLock<HashMap<StoreId, BTreeSet<TimelineKey>>>,
    watchers: Mutex<HashMap<TimelineKey, Vec<Subscriber>>>,
    queue_capacity: usize,
    closed: AtomicBool,
    clock: SharedClock,
}

impl std::fmt::Debug for GlobalIndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalIndexManager")
            .field("timelines", &self.locations.read().len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl GlobalIndexManager {
    /// Empty index
    pub fn new(config: &IndexConfig, clock: SharedClock) -> Self {
        Self {
            locations: RwLock::new(HashMap::new()),
            store_timelines: RwLock::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            queue_capacity: config.watch_queue.max(1),
            closed: AtomicBool::new(false),
            clock,
        }
    }

    // =========================================================================
    // Mutators
    // =========================================================================

    /// Record that `store` hosts `key`, which may not have blocks yet.
    ///
    /// Registering on the current host is `Unchanged`; on another Store it
    /// is a `Conflict`.
    pub fn register_timeline(&self, key: &TimelineKey, store: &StoreId) -> Result<IndexChange> {
        {
            let mut locations = self.locations.write();
            if let Some(location) = locations.get(key) {
                if location.store_id == *store {
                    return Ok(IndexChange::Unchanged);
                }
                return Err(StrandError::conflict(format!(
                    "{key} is hosted on {}, not {store}",
                    location.store_id
                )));
            }
            locations.insert(key.clone(), TimelineLocation::new(key.clone(), store.clone()));
        }
        self.store_timelines
            .write()
            .entry(store.clone())
            .or_default()
            .insert(key.clone());

        tracing::debug!(key = %key, store = %store, "timeline registered");
        self.notify(
            key,
            IndexEvent::Registered {
                key: key.clone(),
                store_id: store.clone(),
            },
        );
        Ok(IndexChange::Applied)
    }

    /// Index a block, registering its timeline if needed.
    ///
    /// A block already indexed on the same Store is `Unchanged`. A block on
    /// a Store other than the timeline's host is a `Conflict`.
    pub fn add_index(&self, mut entry: IndexEntry) -> Result<IndexChange> {
        let now = self.clock.now_ms();
        {
            let mut locations = self.locations.write();
            let location = locations.entry(entry.timeline_key.clone()).or_insert_with(|| {
                TimelineLocation::new(entry.timeline_key.clone(), entry.store_id.clone())
            });

            if let Some(existing) = location.entries.iter().find(|e| e.block_id == entry.block_id) {
                if existing.store_id == entry.store_id {
                    return Ok(IndexChange::Unchanged);
                }
                return Err(StrandError::conflict(format!(
                    "block {} of {} is indexed on {}, not {}",
                    entry.block_id, entry.timeline_key, existing.store_id, entry.store_id
                )));
            }
            if location.store_id != entry.store_id {
                return Err(StrandError::conflict(format!(
                    "{} is hosted on {}, not {}",
                    entry.timeline_key, location.store_id, entry.store_id
                )));
            }

            entry.created_at = now;
            entry.updated_at = now;
            location.entries.push(entry.clone());
            location.rebuild_by_store();
        }
        self.store_timelines
            .write()
            .entry(entry.store_id.clone())
            .or_default()
            .insert(entry.timeline_key.clone());

        tracing::debug!(key = %entry.timeline_key, store = %entry.store_id, block = %entry.block_id, "index entry added");
        let key = entry.timeline_key.clone();
        self.notify(&key, IndexEvent::Added { entry });
        Ok(IndexChange::Applied)
    }

    /// Forget a timeline; removing an unknown key is `Unchanged`
    pub fn remove_index(&self, key: &TimelineKey) -> Result<IndexChange> {
        let Some(location) = self.locations.write().remove(key) else {
            return Ok(IndexChange::Unchanged);
        };
        {
            let mut store_timelines = self.store_timelines.write();
            if let Some(keys) = store_timelines.get_mut(&location.store_id) {
                keys.remove(key);
            }
        }
        tracing::debug!(key = %key, "index entry removed");
        self.notify(key, IndexEvent::Removed { key: key.clone() });
        Ok(IndexChange::Applied)
    }

    /// Record a new size or offset for an indexed block
    pub fn update_index(&self, entry: IndexEntry) -> Result<IndexChange> {
        let updated = {
            let mut locations = self.locations.write();
            let location = locations
                .get_mut(&entry.timeline_key)
                .ok_or_else(|| StrandError::not_found(format!("timeline {}", entry.timeline_key)))?;
            let existing = location
                .entries
                .iter_mut()
                .find(|e| e.block_id == entry.block_id)
                .ok_or_else(|| {
                    StrandError::not_found(format!(
                        "block {} of {}",
                        entry.block_id, entry.timeline_key
                    ))
                })?;
            if existing.store_id != entry.store_id {
                return Err(StrandError::conflict(format!(
                    "block {} is indexed on {}, not {}",
                    entry.block_id, existing.store_id, entry.store_id
                )));
            }
            if existing.size == entry.size && existing.offset == entry.offset {
                return Ok(IndexChange::Unchanged);
            }
            existing.size = entry.size;
            existing.offset = entry.offset;
            existing.updated_at = self.clock.now_ms();
            existing.clone()
        };
        let key = updated.timeline_key.clone();
        self.notify(&key, IndexEvent::Updated { entry: updated });
        Ok(IndexChange::Applied)
    }

    /// Repoint a timeline from `from` to the blocks it now has on `to`.
    ///
    /// Re-applying a completed migration is `Unchanged`; a timeline that is
    /// hosted neither on `from` nor on `to` is a `Conflict`.
    pub fn migrate_timeline(
        &self,
        key: &TimelineKey,
        from: &StoreId,
        to: &StoreId,
        target_entries: Vec<IndexEntry>,
    ) -> Result<IndexChange> {
        if target_entries
            .iter()
            .any(|e| e.store_id != *to || e.timeline_key != *key)
        {
            return Err(StrandError::invalid(format!(
                "migration entries for {key} must all be blocks of it on {to}"
            )));
        }
        let now = self.clock.now_ms();
        {
            let mut locations = self.locations.write();
            let location = locations
                .get_mut(key)
                .ok_or_else(|| StrandError::not_found(format!("timeline {key}")))?;
            if location.store_id == *to {
                return Ok(IndexChange::Unchanged);
            }
            if location.store_id != *from {
                return Err(StrandError::conflict(format!(
                    "{key} is hosted on {}, not {from}",
                    location.store_id
                )));
            }
            location.store_id = to.clone();
            location.entries = target_entries
                .into_iter()
                .map(|mut e| {
                    e.updated_at = now;
                    e
                })
                .collect();
            location.rebuild_by_store();
        }
        {
            let mut store_timelines = self.store_timelines.write();
            if let Some(keys) = store_timelines.get_mut(from) {
                keys.remove(key);
            }
            store_timelines.entry(to.clone()).or_default().insert(key.clone());
        }
        tracing::info!(key = %key, from = %from, to = %to, "timeline repointed");
        self.notify(
            key,
            IndexEvent::Migrated {
                key: key.clone(),
                from: from.clone(),
                to: to.clone(),
            },
        );
        Ok(IndexChange::Applied)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Location of a timeline
    pub fn get_location(&self, key: &TimelineKey) -> Result<TimelineLocation> {
        self.locations
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StrandError::not_found(format!("timeline {key}")))
    }

    /// Hosting Store of a timeline, if indexed
    pub fn store_of(&self, key: &TimelineKey) -> Option<StoreId> {
        self.locations
            .read()
            .get(key)
            .map(|l| l.store_id.clone())
    }

    /// Timelines hosted on a Store, in key order
    pub fn timelines_on_store(&self, store: &StoreId) -> Vec<TimelineKey> {
        self.store_timelines
            .read()
            .get(store)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every indexed timeline, in key order
    pub fn list_timelines(&self) -> Vec<TimelineKey> {
        let mut keys: Vec<TimelineKey> = self.locations.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    // =========================================================================
    // Watching
    // =========================================================================

    /// Subscribe to changes of one timeline
    pub fn watch(&self, key: &TimelineKey) -> Result<IndexWatcher> {
        // Checked under the subscriber lock so shutdown cannot miss a new queue.
        let mut watchers = self.watchers.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(StrandError::unavailable("index is shut down"));
        }
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        watchers
            .entry(key.clone())
            .or_default()
            .push(Subscriber {
                tx,
                dropped: dropped.clone(),
            });
        Ok(IndexWatcher {
            key: key.clone(),
            rx,
            dropped,
        })
    }

    /// Close every watcher queue; later `watch` calls fail
    pub fn shutdown(&self) {
        let watchers = {
            let mut guard = self.watchers.lock();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *guard)
        };
        tracing::info!(
            watched = watchers.len(),
            "index shut down, watcher queues closed"
        );
    }

    fn notify(&self, key: &TimelineKey, event: IndexEvent) {
        let mut watchers = self.watchers.lock();
        let Some(subscribers) = watchers.get_mut(key) else {
            return;
        };
        subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(key = %key, dropped, "watcher queue full, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if subscribers.is_empty() {
            watchers.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::ManualClock;

    fn index(queue: usize) -> GlobalIndexManager {
        GlobalIndexManager::new(&IndexConfig { watch_queue: queue }, ManualClock::new(1))
    }

    fn entry(key: &TimelineKey, store: &str) -> IndexEntry {
        IndexEntry {
            timeline_key: key.clone(),
            store_id: StoreId::new(store),
            block_id: BlockId::new(),
            offset: 0,
            size: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_mutators_are_idempotent() {
        let index = index(8);
        let key = TimelineKey::conversation("c1");
        let e = entry(&key, "s1");
        assert_eq!(index.add_index(e.clone()).unwrap(), IndexChange::Applied);
        assert_eq!(index.add_index(e.clone()).unwrap(), IndexChange::Unchanged);

        let mut grown = e.clone();
        grown.size = 3;
        assert_eq!(index.update_index(grown.clone()).unwrap(), IndexChange::Applied);
        assert_eq!(index.update_index(grown).unwrap(), IndexChange::Unchanged);

        assert_eq!(index.remove_index(&key).unwrap(), IndexChange::Applied);
        assert_eq!(index.remove_index(&key).unwrap(), IndexChange::Unchanged);
        assert!(index.timelines_on_store(&StoreId::new("s1")).is_empty());
    }

    #[test]
    fn test_conflicting_add_is_rejected() {
        let index = index(8);
        let key = TimelineKey::conversation("c1");
        let e = entry(&key, "s1");
        index.add_index(e.clone()).unwrap();

        let mut moved = e;
        moved.store_id = StoreId::new("s2");
        assert!(matches!(index.add_index(moved), Err(StrandError::Conflict { .. })));
        assert!(matches!(
            index.add_index(entry(&key, "s2")),
            Err(StrandError::Conflict { .. })
        ));
    }

    #[test]
    fn test_migration_repoints_and_reapplies() {
        let index = index(8);
        let key = TimelineKey::inbox("bob");
        index.add_index(entry(&key, "s1")).unwrap();
        index.add_index(entry(&key, "s1")).unwrap();

        let target = vec![entry(&key, "s2")];
        let (s1, s2) = (StoreId::new("s1"), StoreId::new("s2"));
        assert_eq!(
            index.migrate_timeline(&key, &s1, &s2, target.clone()).unwrap(),
            IndexChange::Applied
        );
        assert_eq!(
            index.migrate_timeline(&key, &s1, &s2, target).unwrap(),
            IndexChange::Unchanged
        );
        let location = index.get_location(&key).unwrap();
        assert_eq!(location.entries.len(), 1);
        assert_eq!(location.store_id, s2);
        assert!(index.timelines_on_store(&s1).is_empty());
        assert_eq!(index.timelines_on_store(&s2), vec![key.clone()]);

        let s3 = StoreId::new("s3");
        assert!(matches!(
            index.migrate_timeline(&key, &s3, &s1, vec![entry(&key, "s1")]),
            Err(StrandError::Conflict { .. })
        ));
    }

    #[test]
    fn test_empty_timeline_is_located() {
        let index = index(8);
        let key = TimelineKey::conversation("c1");
        let (s1, s2) = (StoreId::new("s1"), StoreId::new("s2"));
        assert_eq!(index.register_timeline(&key, &s1).unwrap(), IndexChange::Applied);
        assert_eq!(index.register_timeline(&key, &s1).unwrap(), IndexChange::Unchanged);
        assert!(matches!(
            index.register_timeline(&key, &s2),
            Err(StrandError::Conflict { .. })
        ));
        assert_eq!(index.store_of(&key), Some(s1.clone()));
        assert!(index.get_location(&key).unwrap().entries.is_empty());

        assert_eq!(
            index.migrate_timeline(&key, &s1, &s2, Vec::new()).unwrap(),
            IndexChange::Applied
        );
        assert_eq!(index.store_of(&key), Some(s2.clone()));
        assert_eq!(index.timelines_on_store(&s2), vec![key]);
        assert!(index.timelines_on_store(&s1).is_empty());
    }

    #[tokio::test]
    async fn test_full_watcher_counts_drops() {
        let index = index(2);
        let key = TimelineKey::conversation("c1");
        let mut watcher = index.watch(&key).unwrap();
        for _ in 0..4 {
            index.add_index(entry(&key, "s1")).unwrap();
        }
        assert_eq!(watcher.dropped(), 2);
        assert!(matches!(watcher.recv().await, Some(IndexEvent::Added { .. })));
        assert!(matches!(watcher.recv().await, Some(IndexEvent::Added { .. })));
        assert!(watcher.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_ends() {
        let index = index(8);
        let key = TimelineKey::conversation("c1");
        let mut watcher = index.watch(&key).unwrap();
        index.add_index(entry(&key, "s1")).unwrap();
        index.remove_index(&key).unwrap();
        index.shutdown();

        assert!(matches!(watcher.recv().await, Some(IndexEvent::Added { .. })));
        assert!(matches!(watcher.recv().await, Some(IndexEvent::Removed { .. })));
        assert!(watcher.recv().await.is_none());
        assert!(index.watch(&key).is_err());
    }

    #[tokio::test]
    async fn test_watch_racing_shutdown_always_ends() {
        let index = index(8);
        let key = TimelineKey::conversation("c1");
        let watchers = std::thread::scope(|scope| {
            let watching = scope.spawn(|| {
                (0..500)
                    .filter_map(|_| index.watch(&key).ok())
                    .collect::<Vec<_>>()
            });
            scope.spawn(|| {
                std::thread::yield_now();
                index.shutdown();
            });
            watching.join().unwrap()
        });

        assert!(index.watchers.lock().is_empty());
        for mut watcher in watchers {
            let next = tokio::time::timeout(std::time::Duration::from_secs(1), watcher.recv()).await;
            assert!(matches!(next, Ok(None)));
        }
        assert!(index.watch(&key).is_err());
    }

    #[test]
    fn test_dropped_watcher_is_pruned() {
        let index = index(8);
        let key = TimelineKey::conversation("c1");
        drop(index.watch(&key).unwrap());
        index.add_index(entry(&key, "s1")).unwrap();
        assert!(index.watchers.lock().is_empty());
    }
}
