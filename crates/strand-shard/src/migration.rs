//! # Timeline Migration
//!
//! Moves a timeline's data and its authoritative location between Stores.
//! `start_migration` returns a `Pending` task at once; the pipeline runs in
//! the background and publishes progress:
//!
//! | progress  | step                                                    |
//! |-----------|---------------------------------------------------------|
//! | 0.05      | timeline lock acquired (renewed until the pipeline ends) |
//! | 0.2       | source timeline read                                    |
//! | 0.4       | empty target timeline created                           |
//! | 0.5 - 0.7 | messages copied oldest first, sequence numbers kept     |
//! | 0.9       | global index repointed to the target                    |
//! | 1.0       | source deleted (best effort)                            |
//!
//! The migration lock is the timeline's own lock key, so writes through the
//! facade fail fast with `AlreadyLocked` while a timeline is moving.
//!
//! Before the repoint the source stays authoritative: a failure or a
//! cancellation ends the task `Failed` or `Cancelled`, the partial target
//! copy is removed, and a retry is safe. Cancellation is checked between
//! steps and is atomic with the repoint; once the index points at the target
//! the task always completes, and cleanup problems are only recorded.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use strand_coordination::{
    DistributedLock, DistributedLockManager, GlobalIndexManager, IndexEntry,
};
use strand_core::time::duration_ms;
use strand_core::{
    Message, MessageQuery, MigrationConfig, Result, SeqId, SharedClock, StoreId, StrandError,
    TaskRegistry, TimelineKey, TimelineService,
};

use crate::directory::StoreDirectory;

/// Migration identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MigrationId(pub Uuid);

impl MigrationId {
    /// Fresh random identifier
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for MigrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Migration lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Accepted, pipeline not started
    Pending,
    /// Pipeline running
    Running,
    /// Target is authoritative
    Completed,
    /// Stopped before the repoint; source still authoritative
    Failed,
    /// Cancelled before the repoint; source still authoritative
    Cancelled,
}

impl MigrationStatus {
    /// No further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Observable state of one migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationTask {
    /// Identifier
    pub id: MigrationId,
    /// Timeline being moved
    pub timeline_key: TimelineKey,
    /// Store the timeline is moving from
    pub source: StoreId,
    /// Store the timeline is moving to
    pub target: StoreId,
    /// Lifecycle state
    pub status: MigrationStatus,
    /// Progress in `[0, 1]`
    pub progress: f64,
    /// Messages to copy
    pub total: u64,
    /// Messages copied so far
    pub copied: u64,
    /// Why the migration failed
    pub error: Option<String>,
    /// Why source cleanup failed after a completed migration
    pub cleanup_error: Option<String>,
    /// Creation time, Unix milliseconds
    pub created_at: u64,
    /// Last change, Unix milliseconds
    pub updated_at: u64,
}

#[derive(Default)]
struct Control {
    cancelled: bool,
    repointed: bool,
}

struct TaskHandle {
    state: watch::Sender<MigrationTask>,
    control: Mutex<Control>,
}

impl TaskHandle {
    fn snapshot(&self) -> MigrationTask {
        self.state.borrow().clone()
    }
}

/// Starts, tracks and cancels timeline migrations
pub struct MigrationManager {
    config: MigrationConfig,
    index: Arc<GlobalIndexManager>,
    locks: Arc<DistributedLockManager>,
    stores: Arc<StoreDirectory>,
    tasks: Arc<TaskRegistry>,
    clock: SharedClock,
    migrations: Mutex<HashMap<MigrationId, Arc<TaskHandle>>>,
}

impl std::fmt::Debug for MigrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationManager")
            .field("migrations", &self.migrations.lock().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MigrationManager {
    /// Manager moving data between the Stores of `stores`
    pub fn new(
        config: MigrationConfig,
        index: Arc<GlobalIndexManager>,
        locks: Arc<DistributedLockManager>,
        stores: Arc<StoreDirectory>,
        tasks: Arc<TaskRegistry>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            index,
            locks,
            stores,
            tasks,
            clock,
            migrations: Mutex::new(HashMap::new()),
        }
    }

    /// Accept a migration of `key` to `target` and run it in the background
    pub fn start_migration(self: &Arc<Self>, key: &TimelineKey, target: &StoreId) -> Result<MigrationTask> {
        let source = self
            .index
            .store_of(key)
            .ok_or_else(|| StrandError::not_found(format!("timeline {key}")))?;
        if source == *target {
            return Err(StrandError::invalid(format!("{key} is already on {target}")));
        }
        self.stores.get(&source)?;
        self.stores.get(target)?;

        let now = self.clock.now_ms();
        let task = MigrationTask {
            id: MigrationId::new(),
            timeline_key: key.clone(),
            source,
            target: target.clone(),
            status: MigrationStatus::Pending,
            progress: 0.0,
            total: 0,
            copied: 0,
            error: None,
            cleanup_error: None,
            created_at: now,
            updated_at: now,
        };
        let handle = Arc::new(TaskHandle {
            state: watch::channel(task.clone()).0,
            control: Mutex::new(Control::default()),
        });
        {
            let mut migrations = self.migrations.lock();
            if let Some(active) = migrations.values().map(|h| h.snapshot()).find(|t| {
                t.timeline_key == *key && !t.status.is_terminal()
            }) {
                return Err(StrandError::already_exists(format!(
                    "migration {} of {key} is in progress",
                    active.id
                )));
            }
            migrations.insert(task.id, handle.clone());
        }

        tracing::info!(
            migration = %task.id,
            key = %key,
            from = %task.source,
            to = %target,
            "migration started"
        );
        let manager = self.clone();
        self.tasks.spawn(async move { manager.run(handle).await });
        Ok(task)
    }

    /// Request cancellation. Returns `false` when it comes too late: the
    /// index already points at the target or the task has finished.
    pub fn cancel_migration(&self, id: MigrationId) -> Result<bool> {
        let handle = self.handle(id)?;
        if handle.snapshot().status.is_terminal() {
            return Ok(false);
        }
        let mut control = handle.control.lock();
        if control.repointed {
            return Ok(false);
        }
        control.cancelled = true;
        tracing::info!(migration = %id, "migration cancellation requested");
        Ok(true)
    }

    /// Current state of a migration
    pub fn get_migration(&self, id: MigrationId) -> Result<MigrationTask> {
        Ok(self.handle(id)?.snapshot())
    }

    /// Every migration, oldest first
    pub fn list_migrations(&self) -> Vec<MigrationTask> {
        let mut all: Vec<_> = self
            .migrations
            .lock()
            .values()
            .map(|h| h.snapshot())
            .collect();
        all.sort_by_key(|t| (t.created_at, t.id));
        all
    }

    /// Unfinished migration of `key`, if any
    pub fn active_for(&self, key: &TimelineKey) -> Option<MigrationTask> {
        self.migrations
            .lock()
            .values()
            .map(|h| h.snapshot())
            .find(|t| t.timeline_key == *key && !t.status.is_terminal())
    }

    /// Wait until a migration reaches a terminal state
    pub async fn wait_for(&self, id: MigrationId) -> Result<MigrationTask> {
        let handle = self.handle(id)?;
        let mut state = handle.state.subscribe();
        let task = state
            .wait_for(|t| t.status.is_terminal())
            .await
            .map_err(|_| StrandError::internal(format!("migration {id} state dropped")))?
            .clone();
        Ok(task)
    }

    /// Forget finished migrations last updated more than `retention` ago
    pub fn purge_finished(&self, retention: Duration) -> usize {
        let cutoff = self.clock.now_ms().saturating_sub(duration_ms(retention));
        let mut migrations = self.migrations.lock();
        let before = migrations.len();
        migrations.retain(|_, h| {
            let task = h.snapshot();
            !(task.status.is_terminal() && task.updated_at <= cutoff)
        });
        before - migrations.len()
    }

    /// Purge finished migrations every `sweep_interval`
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        self.tasks
            .spawn_interval_until(self.config.sweep_interval(), move || {
                let manager = manager.clone();
                async move {
                    let Some(manager) = manager.upgrade() else {
                        return false;
                    };
                    let purged = manager.purge_finished(manager.config.retention());
                    if purged > 0 {
                        tracing::debug!(purged, "finished migrations purged");
                    }
                    true
                }
            });
    }

    /// Request cancellation of every unfinished migration
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<MigrationId> = self.migrations.lock().keys().copied().collect();
        ids.into_iter()
            .filter(|id| matches!(self.cancel_migration(*id), Ok(true)))
            .count()
    }

    // =========================================================================
    // Pipeline
    // =========================================================================

    async fn run(&self, handle: Arc<TaskHandle>) {
        let task = handle.snapshot();
        self.update(&handle, |t| t.status = MigrationStatus::Running);

        let owner = format!("migration:{}", task.id);
        let lock = match self.locks.acquire_lock(
            &task.timeline_key.lock_key(),
            &owner,
            self.config.lock_ttl(),
        ) {
            Ok(lock) => lock,
            Err(err) => {
                self.finish_failed(&handle, err);
                return;
            }
        };
        self.update(&handle, |t| t.progress = 0.05);
        let renewal = self.spawn_renewal(lock.clone());

        let mut target_created = false;
        let result = self.pipeline(&handle, &mut target_created).await;

        renewal.abort();
        if let Err(err) = self.locks.release_lock(&lock.key, lock.lock_id) {
            tracing::warn!(migration = %task.id, error = %err, "migration lock already gone");
        }

        match result {
            Ok(cleanup_error) => {
                self.update(&handle, |t| {
                    t.status = MigrationStatus::Completed;
                    t.progress = 1.0;
                    t.cleanup_error = cleanup_error;
                });
                tracing::info!(
                    migration = %task.id,
                    key = %task.timeline_key,
                    to = %task.target,
                    "migration completed"
                );
            }
            Err(err) => {
                if target_created {
                    self.remove_target_copy(&task).await;
                }
                self.finish_failed(&handle, err);
            }
        }
    }

    /// Runs every step; returns the source cleanup error, if any, once the
    /// target is authoritative
    async fn pipeline(
        &self,
        handle: &TaskHandle,
        target_created: &mut bool,
    ) -> Result<Option<String>> {
        let task = handle.snapshot();
        let key = &task.timeline_key;
        let source = self.stores.get(&task.source)?;
        let target = self.stores.get(&task.target)?;
        let batch = self.config.copy_batch_size.max(1);

        // Read the source
        self.checkpoint(handle)?;
        let info = source.get_timeline(key).await?;
        let messages = read_all(source.as_ref(), key, batch).await?;
        self.update(handle, |t| {
            t.total = messages.len() as u64;
            t.progress = 0.2;
        });
        tracing::debug!(
            migration = %task.id,
            blocks = info.blocks.len(),
            messages = messages.len(),
            "source timeline read"
        );

        // Fresh target timeline
        self.checkpoint(handle)?;
        if target.get_timeline(key).await.is_ok() {
            tracing::warn!(migration = %task.id, store = %task.target, "replacing leftover target copy");
            target.delete_timeline(key).await?;
        }
        *target_created = true;
        target.create_timeline(key).await?;
        self.update(handle, |t| t.progress = 0.4);

        // Copy oldest first
        let total = messages.len();
        let mut copied = 0;
        let mut last_copied: SeqId = 0;
        for chunk in messages.chunks(batch) {
            self.checkpoint(handle)?;
            target.import_messages(key, chunk.to_vec()).await?;
            copied += chunk.len();
            last_copied = chunk.last().map_or(last_copied, |m| m.seq_id);
            let progress = 0.5 + 0.2 * copied as f64 / total as f64;
            self.update(handle, |t| {
                t.copied = copied as u64;
                t.progress = progress;
            });
        }
        self.update(handle, |t| t.progress = 0.7);

        // Repoint
        let placed = target.get_timeline(key).await?;
        self.repoint(handle, IndexEntry::for_timeline(&placed))?;
        self.update(handle, |t| t.progress = 0.9);

        // Nothing below can fail the migration
        self.catch_up(&task, source.as_ref(), target.as_ref(), last_copied)
            .await;
        let cleanup_error = match source.delete_timeline(key).await {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(
                    migration = %task.id,
                    store = %task.source,
                    error = %err,
                    "source cleanup failed"
                );
                Some(err.to_string())
            }
        };
        Ok(cleanup_error)
    }

    fn checkpoint(&self, handle: &TaskHandle) -> Result<()> {
        if handle.control.lock().cancelled {
            return Err(StrandError::cancelled(format!(
                "migration {}",
                handle.snapshot().id
            )));
        }
        Ok(())
    }

    fn repoint(&self, handle: &TaskHandle, entries: Vec<IndexEntry>) -> Result<()> {
        let task = handle.snapshot();
        let mut control = handle.control.lock();
        if control.cancelled {
            return Err(StrandError::cancelled(format!("migration {}", task.id)));
        }
        self.index
            .migrate_timeline(&task.timeline_key, &task.source, &task.target, entries)?;
        control.repointed = true;
        Ok(())
    }

    /// Copy messages that reached the source after the copy step
    async fn catch_up(
        &self,
        task: &MigrationTask,
        source: &dyn TimelineService,
        target: &dyn TimelineService,
        after: SeqId,
    ) {
        let late = match source
            .get_messages(&task.timeline_key, MessageQuery::after(after, usize::MAX))
            .await
        {
            Ok(late) if !late.is_empty() => late,
            Ok(_) => return,
            Err(err) => {
                tracing::warn!(migration = %task.id, error = %err, "catch-up read failed");
                return;
            }
        };
        let count = late.len();
        match target.import_messages(&task.timeline_key, late).await {
            Ok(_) => tracing::info!(migration = %task.id, count, "late messages carried over"),
            Err(err) => {
                tracing::warn!(migration = %task.id, count, error = %err, "late messages not carried over");
            }
        }
    }

    async fn remove_target_copy(&self, task: &MigrationTask) {
        let Ok(target) = self.stores.get(&task.target) else {
            return;
        };
        if let Err(err) = target.delete_timeline(&task.timeline_key).await {
            tracing::warn!(
                migration = %task.id,
                store = %task.target,
                error = %err,
                "partial target copy left behind"
            );
        }
    }

    fn spawn_renewal(&self, lock: DistributedLock) -> JoinHandle<()> {
        let locks = self.locks.clone();
        let every = self.config.lock_renew();
        let ttl = self.config.lock_ttl();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                if let Err(err) = locks.renew_lock(&lock.key, lock.lock_id, ttl) {
                    tracing::warn!(key = %lock.key, error = %err, "migration lock renewal failed");
                    return;
                }
                tracing::trace!(key = %lock.key, "migration lock renewed");
            }
        })
    }

    fn finish_failed(&self, handle: &TaskHandle, err: StrandError) {
        let status = match err {
            StrandError::Cancelled { .. } => MigrationStatus::Cancelled,
            _ => MigrationStatus::Failed,
        };
        let task = handle.snapshot();
        tracing::info!(migration = %task.id, key = %task.timeline_key, ?status, error = %err, "migration stopped");
        self.update(handle, |t| {
            t.status = status;
            t.error = Some(err.to_string());
        });
    }

    fn update(&self, handle: &TaskHandle, f: impl FnOnce(&mut MigrationTask)) {
        let now = self.clock.now_ms();
        handle.state.send_modify(|t| {
            f(t);
            t.updated_at = now;
        });
    }

    fn handle(&self, id: MigrationId) -> Result<Arc<TaskHandle>> {
        self.migrations
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| StrandError::not_found(format!("migration {id}")))
    }
}

/// Every message of a timeline, oldest first, read page by page
async fn read_all(
    service: &dyn TimelineService,
    key: &TimelineKey,
    page: usize,
) -> Result<Vec<Message>> {
    let mut out = Vec::new();
    let mut after = 0;
    loop {
        let batch = service.get_messages(key, MessageQuery::after(after, page)).await?;
        let Some(last) = batch.last() else {
            break;
        };
        after = last.seq_id;
        let full = batch.len() == page;
        out.extend(batch);
        if !full {
            break;
        }
    }
    Ok(out)
}
