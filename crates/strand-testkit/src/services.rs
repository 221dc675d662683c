//! `TimelineService` wrappers for failure and interleaving tests
//!
//! - [`FaultyService`] fails chosen calls a set number of times.
//! - [`GatedService`] parks chosen calls until the test opens the gate, so a
//!   test can act (cancel a migration, take a lock) while a call is known to
//!   be in progress.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Notify};

use strand_core::{
    AppendReceipt, AppendRequest, BlockId, BlockSnapshot, HealthReport, Message, MessageQuery,
    Result, StoreId, StoreStats, StrandError, TimelineInfo, TimelineKey, TimelineService,
};

/// A `TimelineService` method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceCall {
    GetTimeline,
    CreateTimeline,
    DeleteTimeline,
    AddMessage,
    GetMessages,
    ImportMessages,
    GetBlock,
    Stats,
    Health,
}

// =============================================================================
// Fault injection
// =============================================================================

struct Fault {
    remaining: u32,
    error: StrandError,
}

/// Fails selected calls before they reach the inner service
pub struct FaultyService {
    inner: Arc<dyn TimelineService>,
    faults: Mutex<HashMap<ServiceCall, Fault>>,
    calls: Mutex<HashMap<ServiceCall, u32>>,
}

impl FaultyService {
    pub fn new(inner: Arc<dyn TimelineService>) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `times` calls of `call` with `error`
    pub fn fail(&self, call: ServiceCall, times: u32, error: StrandError) {
        self.faults.lock().insert(
            call,
            Fault {
                remaining: times,
                error,
            },
        );
    }

    /// Fail every call of `call` until [`Self::heal`]
    pub fn fail_always(&self, call: ServiceCall, error: StrandError) {
        self.fail(call, u32::MAX, error);
    }

    /// Remove all injected faults
    pub fn heal(&self) {
        self.faults.lock().clear();
    }

    /// Calls of `call` seen so far, failed or not
    pub fn calls(&self, call: ServiceCall) -> u32 {
        self.calls.lock().get(&call).copied().unwrap_or(0)
    }

    fn check(&self, call: ServiceCall) -> Result<()> {
        *self.calls.lock().entry(call).or_default() += 1;
        let mut faults = self.faults.lock();
        let Some(fault) = faults.get_mut(&call) else {
            return Ok(());
        };
        let error = fault.error.clone();
        fault.remaining = fault.remaining.saturating_sub(1);
        if fault.remaining == 0 {
            faults.remove(&call);
        }
        Err(error)
    }
}

#[async_trait]
impl TimelineService for FaultyService {
    fn store_id(&self) -> &StoreId {
        self.inner.store_id()
    }

    async fn get_timeline(&self, key: &TimelineKey) -> Result<TimelineInfo> {
        self.check(ServiceCall::GetTimeline)?;
        self.inner.get_timeline(key).await
    }

    async fn create_timeline(&self, key: &TimelineKey) -> Result<TimelineInfo> {
        self.check(ServiceCall::CreateTimeline)?;
        self.inner.create_timeline(key).await
    }

    async fn delete_timeline(&self, key: &TimelineKey) -> Result<()> {
        self.check(ServiceCall::DeleteTimeline)?;
        self.inner.delete_timeline(key).await
    }

    async fn add_message(&self, request: AppendRequest) -> Result<AppendReceipt> {
        self.check(ServiceCall::AddMessage)?;
        self.inner.add_message(request).await
    }

    async fn get_messages(&self, key: &TimelineKey, query: MessageQuery) -> Result<Vec<Message>> {
        self.check(ServiceCall::GetMessages)?;
        self.inner.get_messages(key, query).await
    }

    async fn import_messages(
        &self,
        key: &TimelineKey,
        messages: Vec<Message>,
    ) -> Result<TimelineInfo> {
        self.check(ServiceCall::ImportMessages)?;
        self.inner.import_messages(key, messages).await
    }

    async fn get_block(&self, block_id: &BlockId) -> Result<BlockSnapshot> {
        self.check(ServiceCall::GetBlock)?;
        self.inner.get_block(block_id).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.check(ServiceCall::Stats)?;
        self.inner.stats().await
    }

    async fn health(&self) -> Result<HealthReport> {
        self.check(ServiceCall::Health)?;
        self.inner.health().await
    }
}

// =============================================================================
// Gates
// =============================================================================

struct GateInner {
    reached: Notify,
    open: watch::Sender<bool>,
}

/// Holds calls until released
#[derive(Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

impl Gate {
    fn new() -> Self {
        let (open, _) = watch::channel(false);
        Self {
            inner: Arc::new(GateInner {
                reached: Notify::new(),
                open,
            }),
        }
    }

    /// Wait until a call is parked at the gate
    pub async fn reached(&self) {
        self.inner.reached.notified().await;
    }

    /// Let parked and future calls through
    pub fn release(&self) {
        self.inner.open.send_replace(true);
    }

    async fn pass(&self) {
        self.inner.reached.notify_one();
        let mut open = self.inner.open.subscribe();
        while !*open.borrow_and_update() {
            if open.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Parks selected calls at a [`Gate`] before they reach the inner service
pub struct GatedService {
    inner: Arc<dyn TimelineService>,
    gates: Mutex<HashMap<ServiceCall, Gate>>,
}

impl GatedService {
    pub fn new(inner: Arc<dyn TimelineService>) -> Self {
        Self {
            inner,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Install (or fetch) the gate for `call`
    pub fn gate(&self, call: ServiceCall) -> Gate {
        self.gates.lock().entry(call).or_insert_with(Gate::new).clone()
    }

    async fn wait(&self, call: ServiceCall) {
        let gate = self.gates.lock().get(&call).cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }
    }
}

#[async_trait]
impl TimelineService for GatedService {
    fn store_id(&self) -> &StoreId {
        self.inner.store_id()
    }

    async fn get_timeline(&self, key: &TimelineKey) -> Result<TimelineInfo> {
        self.wait(ServiceCall::GetTimeline).await;
        self.inner.get_timeline(key).await
    }

    async fn create_timeline(&self, key: &TimelineKey) -> Result<TimelineInfo> {
        self.wait(ServiceCall::CreateTimeline).await;
        self.inner.create_timeline(key).await
    }

    async fn delete_timeline(&self, key: &TimelineKey) -> Result<()> {
        self.wait(ServiceCall::DeleteTimeline).await;
        self.inner.delete_timeline(key).await
    }

    async fn add_message(&self, request: AppendRequest) -> Result<AppendReceipt> {
        self.wait(ServiceCall::AddMessage).await;
        self.inner.add_message(request).await
    }

    async fn get_messages(&self, key: &TimelineKey, query: MessageQuery) -> Result<Vec<Message>> {
        self.wait(ServiceCall::GetMessages).await;
        self.inner.get_messages(key, query).await
    }

    async fn import_messages(
        &self,
        key: &TimelineKey,
        messages: Vec<Message>,
    ) -> Result<TimelineInfo> {
        self.wait(ServiceCall::ImportMessages).await;
        self.inner.import_messages(key, messages).await
    }

    async fn get_block(&self, block_id: &BlockId) -> Result<BlockSnapshot> {
        self.wait(ServiceCall::GetBlock).await;
        self.inner.get_block(block_id).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.wait(ServiceCall::Stats).await;
        self.inner.stats().await
    }

    async fn health(&self) -> Result<HealthReport> {
        self.wait(ServiceCall::Health).await;
        self.inner.health().await
    }
}
