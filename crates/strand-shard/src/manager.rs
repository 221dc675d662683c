//! # Shard Manager
//!
//! The facade callers use. Every mutating call runs as a transaction over
//! the participating Stores; reads take the timeline lock for the duration
//! of the call so they never observe a timeline mid-migration. Locked reads
//! are serialized with writers and with each other. A read that finds the
//! lock held retries with linear backoff up to `locks.read_retry_attempts`
//! times before reporting `AlreadyLocked`.
//!
//! Fan-out keys are grouped by the Store that hosts (or would host) each
//! target timeline and each group becomes one participant. Only the primary
//! timeline's lock is taken. Copies landing on a Store other than the
//! primary's get that Store's own sequence number.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use strand_coordination::{
    DistributedLockManager, GlobalIndexManager, Operation, ParticipantOutcome,
    TransactionCoordinator,
};
use strand_core::{
    AppendReceipt, AppendRequest, HealthReport, HealthStatus, Message, MessageQuery, Result,
    SharedClock, StoreId, StoreStats, StrandConfig, StrandError, SystemClock, TaskRegistry,
    TimelineInfo, TimelineKey, TimelineService,
};
use strand_placement::{RegistryEvent, Router, StoreInfo, StoreLoad, StoreRegistry};

use crate::directory::StoreDirectory;
use crate::migration::{MigrationManager, MigrationTask};
use crate::participant::StoreParticipant;

/// Grace period background tasks get on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Coordinates placement, locking, transactions and migration across Stores
pub struct ShardManager {
    config: StrandConfig,
    clock: SharedClock,
    tasks: Arc<TaskRegistry>,
    registry: Arc<StoreRegistry>,
    router: Arc<Router>,
    index: Arc<GlobalIndexManager>,
    locks: Arc<DistributedLockManager>,
    transactions: Arc<TransactionCoordinator>,
    migrations: Arc<MigrationManager>,
    stores: Arc<StoreDirectory>,
}

impl std::fmt::Debug for ShardManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardManager")
            .field("stores", &self.stores)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl ShardManager {
    /// Manager on the system clock
    pub fn new(config: StrandConfig) -> Result<Self> {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Manager on an explicit clock
    pub fn with_clock(config: StrandConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        let tasks = Arc::new(TaskRegistry::new());
        let registry = Arc::new(StoreRegistry::new(clock.clone()));
        let router = Arc::new(Router::new(config.router.clone(), registry.clone()));
        let index = Arc::new(GlobalIndexManager::new(&config.index, clock.clone()));
        let locks = Arc::new(DistributedLockManager::new(config.locks.clone(), clock.clone()));
        let transactions = Arc::new(TransactionCoordinator::new(
            format!("coordinator:{}", config.store.store_id),
            config.transactions.clone(),
            locks.clone(),
            clock.clone(),
        ));
        let stores = Arc::new(StoreDirectory::new());
        let migrations = Arc::new(MigrationManager::new(
            config.migration.clone(),
            index.clone(),
            locks.clone(),
            stores.clone(),
            tasks.clone(),
            clock.clone(),
        ));
        Ok(Self {
            config,
            clock,
            tasks,
            registry,
            router,
            index,
            locks,
            transactions,
            migrations,
            stores,
        })
    }

    // =========================================================================
    // Components
    // =========================================================================

    /// Store registry
    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    /// Router
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Global index
    pub fn index(&self) -> &Arc<GlobalIndexManager> {
        &self.index
    }

    /// Lease table
    pub fn locks(&self) -> &Arc<DistributedLockManager> {
        &self.locks
    }

    /// Transaction coordinator
    pub fn transactions(&self) -> &Arc<TransactionCoordinator> {
        &self.transactions
    }

    /// Migration manager
    pub fn migrations(&self) -> &Arc<MigrationManager> {
        &self.migrations
    }

    // =========================================================================
    // Topology
    // =========================================================================

    /// Make a Store available for placement, transactions and migration
    pub fn register_store(&self, info: StoreInfo, service: Arc<dyn TimelineService>) -> Result<()> {
        if info.id != *service.store_id() {
            return Err(StrandError::invalid(format!(
                "store info {} does not match service {}",
                info.id,
                service.store_id()
            )));
        }
        let id = info.id.clone();
        self.stores.insert(service.clone());
        self.transactions.register_handler(
            id.clone(),
            Arc::new(StoreParticipant::new(service, self.index.clone())),
        );
        self.registry.register(info);
        self.router.add_store(&id);
        Ok(())
    }

    /// Withdraw a Store; timelines it hosts stay indexed on it
    pub fn unregister_store(&self, id: &StoreId) -> Result<()> {
        self.registry.unregister(id)?;
        self.router.remove_store(id);
        self.transactions.unregister_handler(id);
        self.stores.remove(id);
        Ok(())
    }

    /// Store hosting `key`, or the Store it would be routed to
    pub fn route_timeline(&self, key: &TimelineKey) -> Result<StoreId> {
        match self.index.store_of(key) {
            Some(store) => Ok(store),
            None => self.router.route_timeline(key),
        }
    }

    fn locate(&self, key: &TimelineKey) -> Result<StoreId> {
        self.index
            .store_of(key)
            .ok_or_else(|| StrandError::not_found(format!("timeline {key}")))
    }

    // =========================================================================
    // Transactional writes
    // =========================================================================

    /// Create a timeline on the Store chosen by the placement policy
    pub async fn create_timeline_with_transaction(&self, key: &TimelineKey) -> Result<TimelineInfo> {
        key.validate()?;
        if let Some(store) = self.index.store_of(key) {
            return Err(StrandError::already_exists(format!("{key} is hosted on {store}")));
        }
        let store = self.router.place_new_timeline(key)?;
        let (_, outcomes) = self
            .transactions
            .execute(vec![(store, Operation::CreateTimeline { key: key.clone() })], None)
            .await?;
        match outcomes.into_iter().next() {
            Some(ParticipantOutcome::Timeline(info)) => Ok(info),
            _ => Err(StrandError::internal("create returned no timeline")),
        }
    }

    /// Append to the primary timeline and fan out to every target
    pub async fn add_message_with_transaction(&self, request: AppendRequest) -> Result<AppendReceipt> {
        let primary = self.route_timeline(&request.timeline_key)?;

        let mut groups: BTreeMap<StoreId, Vec<TimelineKey>> = BTreeMap::new();
        for key in request.targets().into_iter().skip(1) {
            groups.entry(self.route_timeline(&key)?).or_default().push(key);
        }
        let local_fanout = groups.remove(&primary).unwrap_or_default();

        let mut participants = vec![(
            primary,
            Operation::AddMessage {
                request: AppendRequest {
                    fanout: local_fanout,
                    ..request.clone()
                },
            },
        )];
        for (store, keys) in groups {
            let mut keys = keys.into_iter();
            let Some(first) = keys.next() else {
                continue;
            };
            participants.push((
                store,
                Operation::AppendFanout {
                    request: AppendRequest {
                        timeline_key: first,
                        sender_id: request.sender_id.clone(),
                        data: request.data.clone(),
                        fanout: keys.collect(),
                    },
                },
            ));
        }

        let (_, outcomes) = self.transactions.execute(participants, None).await?;
        let mut receipts = outcomes.into_iter().filter_map(|o| match o {
            ParticipantOutcome::Appended(receipt) => Some(receipt),
            _ => None,
        });
        let mut receipt = receipts
            .next()
            .ok_or_else(|| StrandError::internal("append returned no receipt"))?;
        for copy in receipts {
            receipt.placements.extend(copy.placements);
        }
        Ok(receipt)
    }

    /// Delete a timeline from its hosting Store and the index
    pub async fn delete_timeline_with_transaction(&self, key: &TimelineKey) -> Result<()> {
        let store = self.locate(key)?;
        self.transactions
            .execute(vec![(store, Operation::DeleteTimeline { key: key.clone() })], None)
            .await?;
        Ok(())
    }

    /// Validate a move with both Stores, then start the migration
    pub async fn migrate_timeline_with_transaction(
        &self,
        key: &TimelineKey,
        target: &StoreId,
    ) -> Result<MigrationTask> {
        let source = self.locate(key)?;
        if source == *target {
            return Err(StrandError::invalid(format!("{key} is already on {target}")));
        }
        if !self.registry.get(target).is_some_and(|s| s.is_healthy()) {
            return Err(StrandError::unavailable(format!("store {target} is not healthy")));
        }
        let operation = Operation::MigrateTimeline {
            key: key.clone(),
            source: source.clone(),
            target: target.clone(),
        };
        self.transactions
            .execute(
                vec![(source, operation.clone()), (target.clone(), operation)],
                None,
            )
            .await?;
        self.migrations.start_migration(key, target)
    }

    // =========================================================================
    // Locked reads
    // =========================================================================

    /// Timeline summary, read under the timeline lock
    pub async fn get_timeline_with_lock(&self, key: &TimelineKey) -> Result<TimelineInfo> {
        let service = self.stores.get(&self.locate(key)?)?;
        self.with_lock(key, service.get_timeline(key)).await
    }

    /// Paginated messages, read under the timeline lock
    pub async fn get_messages_with_lock(
        &self,
        key: &TimelineKey,
        query: MessageQuery,
    ) -> Result<Vec<Message>> {
        let service = self.stores.get(&self.locate(key)?)?;
        self.with_lock(key, service.get_messages(key, query)).await
    }

    async fn with_lock<T>(
        &self,
        key: &TimelineKey,
        read: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let owner = format!("{}:read", self.transactions.coordinator_id());
        let settings = &self.config.locks;
        let mut attempt = 0;
        let lock = loop {
            match self
                .locks
                .acquire_lock(&key.lock_key(), &owner, settings.default_ttl())
            {
                Ok(lock) => break lock,
                Err(StrandError::AlreadyLocked { .. }) if attempt < settings.read_retry_attempts => {
                    attempt += 1;
                    tracing::trace!(key = %key, attempt, "timeline busy, retrying read");
                    tokio::time::sleep(settings.read_retry_backoff() * attempt).await;
                }
                Err(err) => return Err(err),
            }
        };
        let result = read.await;
        if let Err(err) = self.locks.release_lock(&lock.key, lock.lock_id) {
            tracing::debug!(key = %key, error = %err, "read lock already gone");
        }
        result
    }

    // =========================================================================
    // Store introspection
    // =========================================================================

    /// Counters of one Store
    pub async fn get_store_stats(&self, id: &StoreId) -> Result<StoreStats> {
        self.stores.get(id)?.stats().await
    }

    /// Health of every Store, probed concurrently; unreachable or unhealthy
    /// Stores are taken out of placement
    pub async fn health_check(&self) -> Vec<HealthReport> {
        let probes = self.stores.all().into_iter().map(|(id, service)| async move {
            match service.health().await {
                Ok(report) => report,
                Err(err) => HealthReport {
                    store_id: id,
                    status: HealthStatus::Unhealthy,
                    message: err.to_string(),
                    checked_at: self.clock.now_ms(),
                },
            }
        });
        let reports = join_all(probes).await;
        for report in &reports {
            if report.status == HealthStatus::Unhealthy {
                let _ = self.registry.mark_unhealthy(&report.store_id);
            }
        }
        reports
    }

    /// Pull every Store's counters into the registry; returns how many
    /// Stores answered
    pub async fn refresh_loads(&self) -> usize {
        let polls = self
            .stores
            .all()
            .into_iter()
            .map(|(id, service)| async move { (id, service.stats().await) });
        let mut refreshed = 0;
        for (id, result) in join_all(polls).await {
            match result {
                Ok(stats) => {
                    let previous = self.registry.get(&id).map(|s| s.load).unwrap_or_default();
                    let load = StoreLoad::from_stats(&stats).with_host_metrics(&previous);
                    if self.registry.heartbeat(&id, load).is_ok() {
                        refreshed += 1;
                    }
                }
                Err(err) => {
                    tracing::warn!(store = %id, error = %err, "store stats unavailable");
                    let _ = self.registry.mark_unhealthy(&id);
                }
            }
        }
        refreshed
    }

    // =========================================================================
    // Rebalancing
    // =========================================================================

    /// Refresh loads, plan one rebalance cycle and start its migrations
    pub async fn rebalance_once(&self) -> Vec<MigrationTask> {
        self.refresh_loads().await;
        let mut started = Vec::new();
        for proposal in self.router.plan_rebalance(&self.config.rebalance) {
            let candidate = self
                .index
                .timelines_on_store(&proposal.from)
                .into_iter()
                .find(|key| {
                    !self.locks.is_locked(&key.lock_key()) && self.migrations.active_for(key).is_none()
                });
            let Some(key) = candidate else {
                tracing::debug!(from = %proposal.from, "no movable timeline for rebalance");
                continue;
            };
            match self.migrations.start_migration(&key, &proposal.to) {
                Ok(task) => started.push(task),
                Err(err) => {
                    tracing::warn!(key = %key, to = %proposal.to, error = %err, "rebalance migration not started");
                }
            }
        }
        started
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the lock and transaction sweeps, registry tracking, heartbeat
    /// expiry and periodic rebalancing
    pub fn start(self: &Arc<Self>) {
        self.locks.spawn_sweeper(&self.tasks);
        self.transactions.spawn_sweeper(&self.tasks);
        self.migrations.spawn_sweeper();

        let mut events = self.registry.subscribe();
        let router = self.router.clone();
        self.tasks.spawn_cancellable(async move {
            loop {
                match events.recv().await {
                    Ok(RegistryEvent::Registered(info)) => router.add_store(&info.id),
                    Ok(RegistryEvent::Unregistered(info)) => router.remove_store(&info.id),
                    Ok(RegistryEvent::Unhealthy(info)) => {
                        tracing::info!(store = %info.id, "store left placement");
                    }
                    Ok(RegistryEvent::Heartbeat(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "registry events lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let registry = self.registry.clone();
        let timeout = self.config.registry.heartbeat_timeout();
        self.tasks.spawn_interval_until(timeout, move || {
            let registry = registry.clone();
            async move {
                let stale = registry.expire_stale(timeout);
                if !stale.is_empty() {
                    tracing::warn!(stores = ?stale, "stores missed heartbeats");
                }
                true
            }
        });

        if self.config.rebalance.enabled {
            let manager = Arc::downgrade(self);
            self.tasks
                .spawn_interval_until(self.config.rebalance.interval(), move || {
                    let manager = manager.clone();
                    async move {
                        let Some(manager) = manager.upgrade() else {
                            return false;
                        };
                        let started = manager.rebalance_once().await;
                        if !started.is_empty() {
                            tracing::info!(migrations = started.len(), "rebalance cycle");
                        }
                        true
                    }
                });
        }
        tracing::info!(stores = self.stores.ids().len(), "shard manager started");
    }

    /// Cancel unfinished migrations, close index watchers and stop
    /// background tasks
    pub async fn shutdown(&self) {
        let cancelled = self.migrations.cancel_all();
        self.index.shutdown();
        self.tasks.drain(SHUTDOWN_GRACE).await;
        tracing::info!(cancelled_migrations = cancelled, "shard manager stopped");
    }
}
