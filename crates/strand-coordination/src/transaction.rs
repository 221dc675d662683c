//! # Transaction Coordinator
//!
//! Lease-guarded prepare/commit across Store participants.
//!
//! ```text
//! Pending ──prepare──▶ Prepared ──commit──▶ Committed
//!    │                    │
//!    └──abort/timeout─────┴──▶ Aborted | Timeout
//! ```
//!
//! `begin_transaction` acquires every lock key implied by the participants'
//! operations, de-duplicated and in sorted order; any failure releases what
//! was taken. `prepare_transaction` only checks preconditions; a failed
//! prepare aborts every participant and no commit handler runs.
//!
//! A committed participant cannot be rolled back. When a commit fails on
//! some participants the configured [`CommitPolicy`] decides what happens:
//! `RetryUntilSuccess` retries participants that failed with a transient
//! error (see [`StrandError::is_retryable`]) until the attempts run out or
//! the transaction deadline, where its leases expire, is reached. A commit that
//! still fails, or any failure under `AbortOnFailure`, marks the transaction
//! `Aborted` and reports `PartialFailure` naming both sides.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use strand_core::time::duration_ms;
use strand_core::{
    AppendReceipt, AppendRequest, CommitPolicy, Result, SharedClock, StoreId, StrandError,
    TaskRegistry, TimelineInfo, TimelineKey, TransactionConfig,
};

use crate::locks::{DistributedLock, DistributedLockManager};

// =============================================================================
// Operations
// =============================================================================

/// Work a participant performs on its Store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Operation {
    /// Create an empty timeline
    CreateTimeline {
        /// Timeline to create
        key: TimelineKey,
    },
    /// Append a message to its primary timeline and same-Store fan-out targets
    AddMessage {
        /// The append
        request: AppendRequest,
    },
    /// Copy a message into fan-out timelines hosted away from the primary
    AppendFanout {
        /// Append whose primary key is the first fan-out target on this Store
        request: AppendRequest,
    },
    /// Remove a timeline and its blocks
    DeleteTimeline {
        /// Timeline to delete
        key: TimelineKey,
    },
    /// Move a timeline between Stores
    MigrateTimeline {
        /// Timeline to move
        key: TimelineKey,
        /// Current host
        source: StoreId,
        /// New host
        target: StoreId,
    },
}

impl Operation {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateTimeline { .. } => "create_timeline",
            Self::AddMessage { .. } => "add_message",
            Self::AppendFanout { .. } => "append_fanout",
            Self::DeleteTimeline { .. } => "delete_timeline",
            Self::MigrateTimeline { .. } => "migrate_timeline",
        }
    }

    /// Timeline the operation is about
    pub fn timeline_key(&self) -> &TimelineKey {
        match self {
            Self::CreateTimeline { key }
            | Self::DeleteTimeline { key }
            | Self::MigrateTimeline { key, .. } => key,
            Self::AddMessage { request } | Self::AppendFanout { request } => &request.timeline_key,
        }
    }

    /// Lock keys the operation needs. Fan-out copies are not locked; only
    /// the primary timeline of an append is.
    pub fn lock_keys(&self) -> Vec<String> {
        match self {
            Self::AppendFanout { .. } => Vec::new(),
            other => vec![other.timeline_key().lock_key()],
        }
    }
}

/// What a committed participant produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ParticipantOutcome {
    /// Nothing to report
    Done,
    /// Timeline state after the operation
    Timeline(TimelineInfo),
    /// Append result
    Appended(AppendReceipt),
}

/// Store-side half of the protocol
#[async_trait]
pub trait ParticipantHandler: Send + Sync {
    /// Check preconditions without mutating anything
    async fn prepare(&self, txn: TransactionId, operation: &Operation) -> Result<()>;

    /// Apply the operation
    async fn commit(&self, txn: TransactionId, operation: &Operation)
        -> Result<ParticipantOutcome>;

    /// Discard any prepared state
    async fn abort(&self, txn: TransactionId, operation: &Operation) -> Result<()>;
}

// =============================================================================
// Transaction records
// =============================================================================

/// Transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    /// Fresh random identifier
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Locks held, nothing checked yet
    Pending,
    /// Every participant prepared
    Prepared,
    /// Every participant committed
    Committed,
    /// Aborted by the caller, a failed prepare, or a failed commit
    Aborted,
    /// Ran past its deadline
    Timeout,
}

impl TransactionStatus {
    /// No further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted | Self::Timeout)
    }
}

/// Per-participant progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    /// Not contacted yet
    Pending,
    /// Prepare succeeded
    Prepared,
    /// Commit succeeded
    Committed,
    /// Prepare or commit failed
    Failed,
    /// Abort handler ran
    Aborted,
}

/// One Store's part in a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Participating Store
    pub store_id: StoreId,
    /// Its operation
    pub operation: Operation,
    /// Progress
    pub status: ParticipantStatus,
    /// Last error, if any
    pub error: Option<String>,
}

/// Coordinator-side transaction record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedTransaction {
    /// Identifier
    pub id: TransactionId,
    /// Coordinator that owns the record
    pub coordinator_id: String,
    /// Participants in the order given to `begin_transaction`
    pub participants: Vec<Participant>,
    /// Lifecycle state
    pub status: TransactionStatus,
    /// Deadline relative to `created_at`
    pub timeout_ms: u64,
    /// Creation time, Unix milliseconds
    pub created_at: u64,
    /// Last state change, Unix milliseconds
    pub updated_at: u64,
    /// Sorted, de-duplicated lock keys
    pub lock_keys: Vec<String>,
    /// Leases held while the transaction is live
    pub locks: Vec<DistributedLock>,
}

impl DistributedTransaction {
    /// Deadline, Unix milliseconds
    pub fn deadline(&self) -> u64 {
        self.created_at.saturating_add(self.timeout_ms)
    }

    fn lock_owner(&self) -> String {
        format!("txn:{}", self.id)
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Drives transactions across registered participant handlers
pub struct TransactionCoordinator {
    coordinator_id: String,
    config: TransactionConfig,
    locks: Arc<DistributedLockManager>,
    handlers: RwLock<HashMap<StoreId, Arc<dyn ParticipantHandler>>>,
    transactions: Mutex<HashMap<TransactionId, DistributedTransaction>>,
    in_flight: Mutex<HashSet<TransactionId>>,
    clock: SharedClock,
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("coordinator_id", &self.coordinator_id)
            .field("transactions", &self.transactions.lock().len())
            .finish_non_exhaustive()
    }
}

/// Marks a transaction as being driven by a caller so the sweeper leaves it alone
struct InFlight<'a> {
    set: &'a Mutex<HashSet<TransactionId>>,
    id: TransactionId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

impl TransactionCoordinator {
    /// Coordinator using `locks` for lock-key acquisition
    pub fn new(
        coordinator_id: impl Into<String>,
        config: TransactionConfig,
        locks: Arc<DistributedLockManager>,
        clock: SharedClock,
    ) -> Self {
        Self {
            coordinator_id: coordinator_id.into(),
            config,
            locks,
            handlers: RwLock::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            clock,
        }
    }

    /// Coordinator identifier
    pub fn coordinator_id(&self) -> &str {
        &self.coordinator_id
    }

    /// Route participant calls for `store` to `handler`
    pub fn register_handler(&self, store: StoreId, handler: Arc<dyn ParticipantHandler>) {
        tracing::debug!(store = %store, "participant handler registered");
        self.handlers.write().insert(store, handler);
    }

    /// Stop routing participant calls for `store`
    pub fn unregister_handler(&self, store: &StoreId) {
        self.handlers.write().remove(store);
    }

    // =========================================================================
    // Protocol
    // =========================================================================

    /// Acquire every lock the participants imply and record a `Pending`
    /// transaction
    pub fn begin_transaction(
        &self,
        participants: Vec<(StoreId, Operation)>,
        timeout: Option<Duration>,
    ) -> Result<DistributedTransaction> {
        if participants.is_empty() {
            return Err(StrandError::invalid("transaction needs at least one participant"));
        }
        let timeout = timeout.unwrap_or_else(|| self.config.default_timeout());
        if timeout.is_zero() {
            return Err(StrandError::invalid("transaction timeout must be positive"));
        }
        {
            let handlers = self.handlers.read();
            if let Some((store, _)) = participants.iter().find(|(s, _)| !handlers.contains_key(s)) {
                return Err(StrandError::not_found(format!("participant store {store}")));
            }
        }

        let mut lock_keys: Vec<String> = participants
            .iter()
            .flat_map(|(_, op)| op.lock_keys())
            .collect();
        lock_keys.sort();
        lock_keys.dedup();

        let now = self.clock.now_ms();
        let mut txn = DistributedTransaction {
            id: TransactionId::new(),
            coordinator_id: self.coordinator_id.clone(),
            participants: participants
                .into_iter()
                .map(|(store_id, operation)| Participant {
                    store_id,
                    operation,
                    status: ParticipantStatus::Pending,
                    error: None,
                })
                .collect(),
            status: TransactionStatus::Pending,
            timeout_ms: duration_ms(timeout),
            created_at: now,
            updated_at: now,
            lock_keys,
            locks: Vec::new(),
        };

        let owner = txn.lock_owner();
        for key in &txn.lock_keys {
            match self.locks.acquire_lock(key, &owner, timeout) {
                Ok(lock) => txn.locks.push(lock),
                Err(err) => {
                    self.release_locks(&txn.locks);
                    tracing::debug!(txn = %txn.id, key = %key, error = %err, "transaction lock unavailable");
                    return Err(err);
                }
            }
        }

        tracing::debug!(
            txn = %txn.id,
            participants = txn.participants.len(),
            locks = txn.locks.len(),
            "transaction begun"
        );
        self.transactions.lock().insert(txn.id, txn.clone());
        Ok(txn)
    }

    /// Run every participant's prepare handler; the first failure aborts
    /// the transaction
    pub async fn prepare_transaction(&self, id: TransactionId) -> Result<()> {
        let (_guard, txn) = self.claim(id, TransactionStatus::Pending)?;
        let deadline = txn.deadline();

        for (index, participant) in txn.participants.iter().enumerate() {
            let handler = self.handler(&participant.store_id);
            let result = match handler {
                Ok(handler) => {
                    self.bounded(deadline, "prepare", handler.prepare(id, &participant.operation))
                        .await
                }
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => self.set_participant(id, index, ParticipantStatus::Prepared, None),
                Err(err) => {
                    tracing::info!(
                        txn = %id,
                        store = %participant.store_id,
                        op = participant.operation.name(),
                        error = %err,
                        "prepare failed, aborting"
                    );
                    self.set_participant(id, index, ParticipantStatus::Failed, Some(&err));
                    self.abort_participants(&txn).await;
                    self.finish(id, TransactionStatus::Aborted);
                    return Err(err);
                }
            }
        }

        self.transition(id, TransactionStatus::Prepared);
        tracing::debug!(txn = %id, "transaction prepared");
        Ok(())
    }

    /// Commit every prepared participant, returning their outcomes in
    /// participant order
    pub async fn commit_transaction(&self, id: TransactionId) -> Result<Vec<ParticipantOutcome>> {
        let (_guard, txn) = self.claim(id, TransactionStatus::Prepared)?;
        let attempts = match self.config.commit_policy {
            CommitPolicy::AbortOnFailure => 1,
            CommitPolicy::RetryUntilSuccess { max_attempts, .. } => max_attempts.max(1),
        };
        let backoff = match self.config.commit_policy {
            CommitPolicy::AbortOnFailure => Duration::ZERO,
            CommitPolicy::RetryUntilSuccess { backoff_ms, .. } => Duration::from_millis(backoff_ms),
        };

        let deadline = txn.deadline();
        let mut results: Vec<Option<Result<ParticipantOutcome>>> =
            vec![None; txn.participants.len()];
        for attempt in 1..=attempts {
            for (index, participant) in txn.participants.iter().enumerate() {
                match &results[index] {
                    Some(Ok(_)) => continue,
                    Some(Err(err)) if !err.is_retryable() => continue,
                    _ => {}
                }
                let result = match self.handler(&participant.store_id) {
                    Ok(handler) => {
                        self.bounded(deadline, "commit", handler.commit(id, &participant.operation))
                            .await
                    }
                    Err(err) => Err(err),
                };
                if let Err(err) = &result {
                    tracing::warn!(
                        txn = %id,
                        store = %participant.store_id,
                        op = participant.operation.name(),
                        attempt,
                        error = %err,
                        "participant commit failed"
                    );
                }
                results[index] = Some(result);
            }
            let retry = results
                .iter()
                .any(|r| matches!(r, Some(Err(err)) if err.is_retryable()));
            if !retry || attempt == attempts {
                break;
            }
            // Leases expire at the deadline; a later retry could race a new holder.
            if self.clock.now_ms().saturating_add(duration_ms(backoff)) >= deadline {
                tracing::warn!(txn = %id, attempt, "commit retries stopped at transaction deadline");
                break;
            }
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
        }

        let mut outcomes = Vec::with_capacity(results.len());
        let mut committed = vec![false; results.len()];
        let mut applied = Vec::new();
        let mut failed = Vec::new();
        let mut first_error = None;
        for (index, result) in results.into_iter().enumerate() {
            let store = &txn.participants[index].store_id;
            match result {
                Some(Ok(outcome)) => {
                    self.set_participant(id, index, ParticipantStatus::Committed, None);
                    committed[index] = true;
                    applied.push(store.to_string());
                    outcomes.push(outcome);
                }
                Some(Err(err)) => {
                    self.set_participant(id, index, ParticipantStatus::Failed, Some(&err));
                    failed.push(format!("{store}: {err}"));
                    first_error.get_or_insert(err);
                }
                None => {}
            }
        }

        let Some(first_error) = first_error else {
            self.finish(id, TransactionStatus::Committed);
            tracing::debug!(txn = %id, participants = applied.len(), "transaction committed");
            return Ok(outcomes);
        };

        // Committed participants cannot be undone; only the failed ones are aborted.
        for (index, participant) in txn.participants.iter().enumerate() {
            if !committed[index] {
                self.abort_participant(id, index, participant).await;
            }
        }
        self.finish(id, TransactionStatus::Aborted);
        tracing::warn!(txn = %id, applied = ?applied, failed = ?failed, "transaction aborted after commit failure");

        if applied.is_empty() {
            Err(first_error)
        } else {
            Err(StrandError::partial_failure(
                format!("commit transaction {id}"),
                applied,
                failed,
            ))
        }
    }

    /// Abort a live transaction; aborting a finished abort is a no-op
    pub async fn abort_transaction(&self, id: TransactionId) -> Result<()> {
        let txn = self.get_transaction(id)?;
        match txn.status {
            TransactionStatus::Aborted | TransactionStatus::Timeout => return Ok(()),
            TransactionStatus::Committed => {
                return Err(StrandError::invalid(format!(
                    "transaction {id} is already committed"
                )))
            }
            TransactionStatus::Pending | TransactionStatus::Prepared => {}
        }
        let (_guard, txn) = self.claim(id, txn.status)?;
        self.abort_participants(&txn).await;
        self.finish(id, TransactionStatus::Aborted);
        tracing::info!(txn = %id, "transaction aborted");
        Ok(())
    }

    /// Begin, prepare and commit in one call
    pub async fn execute(
        &self,
        participants: Vec<(StoreId, Operation)>,
        timeout: Option<Duration>,
    ) -> Result<(TransactionId, Vec<ParticipantOutcome>)> {
        let txn = self.begin_transaction(participants, timeout)?;
        self.prepare_transaction(txn.id).await?;
        let outcomes = self.commit_transaction(txn.id).await?;
        Ok((txn.id, outcomes))
    }

    // =========================================================================
    // Introspection and housekeeping
    // =========================================================================

    /// Snapshot of a transaction
    pub fn get_transaction(&self, id: TransactionId) -> Result<DistributedTransaction> {
        self.transactions
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| StrandError::not_found(format!("transaction {id}")))
    }

    /// Every known transaction, oldest first
    pub fn list_transactions(&self) -> Vec<DistributedTransaction> {
        let mut all: Vec<_> = self.transactions.lock().values().cloned().collect();
        all.sort_by_key(|t| (t.created_at, t.id));
        all
    }

    /// Time out live transactions past their deadline that no caller is
    /// currently driving; returns how many were timed out
    pub async fn sweep_timeouts(&self) -> usize {
        let now = self.clock.now_ms();
        let expired: Vec<DistributedTransaction> = {
            let in_flight = self.in_flight.lock();
            self.transactions
                .lock()
                .values()
                .filter(|t| !t.status.is_terminal() && t.deadline() <= now)
                .filter(|t| !in_flight.contains(&t.id))
                .cloned()
                .collect()
        };
        let mut swept = 0;
        for txn in expired {
            let Ok((_guard, txn)) = self.claim_unchecked(txn.id) else {
                continue;
            };
            self.abort_participants(&txn).await;
            self.finish(txn.id, TransactionStatus::Timeout);
            tracing::info!(txn = %txn.id, "transaction timed out");
            swept += 1;
        }
        swept
    }

    /// Forget finished transactions last updated more than `retention` ago
    pub fn purge_finished(&self, retention: Duration) -> usize {
        let cutoff = self.clock.now_ms().saturating_sub(duration_ms(retention));
        let mut transactions = self.transactions.lock();
        let before = transactions.len();
        transactions.retain(|_, t| !(t.status.is_terminal() && t.updated_at <= cutoff));
        before - transactions.len()
    }

    /// Sweep timeouts and purge old records every `sweep_interval`
    pub fn spawn_sweeper(self: &Arc<Self>, tasks: &TaskRegistry) {
        let coordinator = Arc::downgrade(self);
        tasks.spawn_interval_until(self.config.sweep_interval(), move || {
            let coordinator = coordinator.clone();
            async move {
                let Some(coordinator) = coordinator.upgrade() else {
                    return false;
                };
                let timed_out = coordinator.sweep_timeouts().await;
                let purged = coordinator.purge_finished(coordinator.config.retention());
                if timed_out + purged > 0 {
                    tracing::debug!(timed_out, purged, "transaction sweep");
                }
                true
            }
        });
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn handler(&self, store: &StoreId) -> Result<Arc<dyn ParticipantHandler>> {
        self.handlers
            .read()
            .get(store)
            .cloned()
            .ok_or_else(|| StrandError::not_found(format!("participant store {store}")))
    }

    /// Take exclusive control of a transaction in `expected` state. A
    /// transaction found past its deadline is timed out instead.
    fn claim(
        &self,
        id: TransactionId,
        expected: TransactionStatus,
    ) -> Result<(InFlight<'_>, DistributedTransaction)> {
        let (guard, txn) = self.claim_unchecked(id)?;
        if txn.status != expected {
            return Err(StrandError::invalid(format!(
                "transaction {id} is {:?}, expected {expected:?}",
                txn.status
            )));
        }
        if txn.deadline() <= self.clock.now_ms() {
            self.finish(id, TransactionStatus::Timeout);
            tracing::info!(txn = %id, "transaction timed out");
            return Err(StrandError::timeout(format!("transaction {id}")));
        }
        Ok((guard, txn))
    }

    fn claim_unchecked(&self, id: TransactionId) -> Result<(InFlight<'_>, DistributedTransaction)> {
        let txn = self.get_transaction(id)?;
        if txn.status.is_terminal() {
            return Err(StrandError::invalid(format!(
                "transaction {id} is already {:?}",
                txn.status
            )));
        }
        if !self.in_flight.lock().insert(id) {
            return Err(StrandError::conflict(format!(
                "transaction {id} is being driven by another caller"
            )));
        }
        Ok((
            InFlight {
                set: &self.in_flight,
                id,
            },
            txn,
        ))
    }

    async fn bounded<T>(
        &self,
        deadline: u64,
        phase: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let remaining = deadline.saturating_sub(self.clock.now_ms());
        tokio::time::timeout(Duration::from_millis(remaining), fut)
            .await
            .map_err(|_| StrandError::timeout(format!("participant {phase}")))?
    }

    async fn abort_participants(&self, txn: &DistributedTransaction) {
        for (index, participant) in txn.participants.iter().enumerate() {
            self.abort_participant(txn.id, index, participant).await;
        }
    }

    async fn abort_participant(&self, id: TransactionId, index: usize, participant: &Participant) {
        let result = match self.handler(&participant.store_id) {
            Ok(handler) => handler.abort(id, &participant.operation).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                let mut transactions = self.transactions.lock();
                if let Some(p) = transactions
                    .get_mut(&id)
                    .and_then(|t| t.participants.get_mut(index))
                {
                    if p.status != ParticipantStatus::Failed {
                        p.status = ParticipantStatus::Aborted;
                    }
                }
            }
            Err(err) => tracing::warn!(
                txn = %id,
                store = %participant.store_id,
                error = %err,
                "participant abort failed"
            ),
        }
    }

    fn set_participant(
        &self,
        id: TransactionId,
        index: usize,
        status: ParticipantStatus,
        error: Option<&StrandError>,
    ) {
        let now = self.clock.now_ms();
        let mut transactions = self.transactions.lock();
        if let Some(txn) = transactions.get_mut(&id) {
            if let Some(p) = txn.participants.get_mut(index) {
                p.status = status;
                p.error = error.map(ToString::to_string);
            }
            txn.updated_at = now;
        }
    }

    fn transition(&self, id: TransactionId, status: TransactionStatus) {
        let now = self.clock.now_ms();
        if let Some(txn) = self.transactions.lock().get_mut(&id) {
            txn.status = status;
            txn.updated_at = now;
        }
    }

    /// Move to a terminal state and release the transaction's leases
    fn finish(&self, id: TransactionId, status: TransactionStatus) {
        let now = self.clock.now_ms();
        let locks = {
            let mut transactions = self.transactions.lock();
            let Some(txn) = transactions.get_mut(&id) else {
                return;
            };
            txn.status = status;
            txn.updated_at = now;
            std::mem::take(&mut txn.locks)
        };
        self.release_locks(&locks);
    }

    fn release_locks(&self, locks: &[DistributedLock]) {
        for lock in locks {
            if let Err(err) = self.locks.release_lock(&lock.key, lock.lock_id) {
                tracing::debug!(key = %lock.key, error = %err, "transaction lock already gone");
            }
        }
    }
}
