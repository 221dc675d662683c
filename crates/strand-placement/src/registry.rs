//! Store registry
//!
//! Tracks the Stores taking part in placement, their liveness and their last
//! reported load, and publishes a [`RegistryEvent`] for every change.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::broadcast;

use strand_core::time::duration_ms;
use strand_core::{Result, SharedClock, StoreId, StoreStats, StrandError};

/// Capacity of the registry event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Liveness of a registered Store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStatus {
    /// Heartbeats arrive and the Store accepts placement
    Healthy,
    /// Missed heartbeats or reported failing; skipped by placement
    Unhealthy,
}

/// Last reported load of a Store
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreLoad {
    /// Hosted timelines
    pub timeline_count: u64,
    /// Timeline count the Store is sized for
    pub max_timelines: u64,
    /// Message slots in use
    pub used_capacity: u64,
    /// Message slot limit
    pub max_capacity: u64,
    /// CPU usage in `[0, 1]`
    pub cpu_usage: f64,
    /// Memory usage in `[0, 1]`
    pub mem_usage: f64,
    /// Observed request latency in milliseconds
    pub latency_ms: f64,
}

impl StoreLoad {
    /// Load derived from store statistics; host metrics stay at zero
    pub fn from_stats(stats: &StoreStats) -> Self {
        Self {
            timeline_count: stats.timeline_count,
            max_timelines: stats.max_timelines,
            used_capacity: stats.current_capacity,
            max_capacity: stats.max_capacity,
            ..Self::default()
        }
    }

    /// Keep host metrics from `previous`, take counters from `self`
    pub fn with_host_metrics(mut self, previous: &StoreLoad) -> Self {
        self.cpu_usage = previous.cpu_usage;
        self.mem_usage = previous.mem_usage;
        self.latency_ms = previous.latency_ms;
        self
    }

    /// Fraction of message slots in use
    pub fn capacity_ratio(&self) -> f64 {
        ratio(self.used_capacity, self.max_capacity)
    }

    /// Fraction of the timeline budget in use
    pub fn timeline_ratio(&self) -> f64 {
        ratio(self.timeline_count, self.max_timelines)
    }

    /// Rebalancing load factor: the larger of the two usage ratios
    pub fn load_factor(&self) -> f64 {
        self.timeline_ratio().max(self.capacity_ratio())
    }
}

fn ratio(used: u64, max: u64) -> f64 {
    if max == 0 {
        0.0
    } else {
        used as f64 / max as f64
    }
}

/// A registered Store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreInfo {
    /// Store identifier
    pub id: StoreId,
    /// RPC address, empty for in-process Stores
    pub address: String,
    /// Liveness
    pub status: StoreStatus,
    /// Last heartbeat, Unix milliseconds
    pub last_seen: u64,
    /// Last reported load
    pub load: StoreLoad,
    /// Free-form labels
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl StoreInfo {
    /// A healthy Store with no load reported yet
    pub fn new(id: impl Into<StoreId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            status: StoreStatus::Healthy,
            last_seen: 0,
            load: StoreLoad::default(),
            metadata: BTreeMap::new(),
        }
    }

    /// Set the reported load
    pub fn with_load(mut self, load: StoreLoad) -> Self {
        self.load = load;
        self
    }

    /// Whether placement may use this Store
    pub fn is_healthy(&self) -> bool {
        self.status == StoreStatus::Healthy
    }
}

/// Registry change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "store")]
pub enum RegistryEvent {
    /// A Store joined
    Registered(StoreInfo),
    /// A Store left
    Unregistered(StoreInfo),
    /// A Store reported liveness and load
    Heartbeat(StoreInfo),
    /// A Store was marked unhealthy
    Unhealthy(StoreInfo),
}

impl RegistryEvent {
    /// The Store the event is about
    pub fn store(&self) -> &StoreInfo {
        match self {
            Self::Registered(info)
            | Self::Unregistered(info)
            | Self::Heartbeat(info)
            | Self::Unhealthy(info) => info,
        }
    }
}

/// Registry of Stores available for placement
#[derive(Debug)]
pub struct StoreRegistry {
    stores: RwLock<BTreeMap<StoreId, StoreInfo>>,
    events: broadcast::Sender<RegistryEvent>,
    clock: SharedClock,
}

impl StoreRegistry {
    /// Empty registry
    pub fn new(clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            stores: RwLock::new(BTreeMap::new()),
            events,
            clock,
        }
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Add or replace a Store; it is considered seen now
    pub fn register(&self, mut info: StoreInfo) {
        info.last_seen = self.clock.now_ms();
        tracing::info!(store = %info.id, address = %info.address, "store registered");
        self.stores.write().insert(info.id.clone(), info.clone());
        self.publish(RegistryEvent::Registered(info));
    }

    /// Remove a Store
    pub fn unregister(&self, id: &StoreId) -> Result<StoreInfo> {
        let info = self
            .stores
            .write()
            .remove(id)
            .ok_or_else(|| StrandError::not_found(format!("store {id}")))?;
        tracing::info!(store = %id, "store unregistered");
        self.publish(RegistryEvent::Unregistered(info.clone()));
        Ok(info)
    }

    /// Record liveness and the latest load; an unhealthy Store recovers
    pub fn heartbeat(&self, id: &StoreId, load: StoreLoad) -> Result<()> {
        let info = {
            let mut stores = self.stores.write();
            let info = stores
                .get_mut(id)
                .ok_or_else(|| StrandError::not_found(format!("store {id}")))?;
            if info.status == StoreStatus::Unhealthy {
                tracing::info!(store = %id, "store recovered");
            }
            info.status = StoreStatus::Healthy;
            info.last_seen = self.clock.now_ms();
            info.load = load;
            info.clone()
        };
        self.publish(RegistryEvent::Heartbeat(info));
        Ok(())
    }

    /// Take a Store out of placement until its next heartbeat
    pub fn mark_unhealthy(&self, id: &StoreId) -> Result<()> {
        let info = {
            let mut stores = self.stores.write();
            let info = stores
                .get_mut(id)
                .ok_or_else(|| StrandError::not_found(format!("store {id}")))?;
            if info.status == StoreStatus::Unhealthy {
                return Ok(());
            }
            info.status = StoreStatus::Unhealthy;
            info.clone()
        };
        tracing::warn!(store = %id, "store marked unhealthy");
        self.publish(RegistryEvent::Unhealthy(info));
        Ok(())
    }

    /// Mark every healthy Store silent for longer than `timeout` unhealthy
    pub fn expire_stale(&self, timeout: Duration) -> Vec<StoreId> {
        let now = self.clock.now_ms();
        let cutoff = duration_ms(timeout);
        let stale: Vec<StoreId> = self
            .stores
            .read()
            .values()
            .filter(|s| s.is_healthy() && now.saturating_sub(s.last_seen) > cutoff)
            .map(|s| s.id.clone())
            .collect();
        for id in &stale {
            let _ = self.mark_unhealthy(id);
        }
        stale
    }

    /// One Store
    pub fn get(&self, id: &StoreId) -> Option<StoreInfo> {
        self.stores.read().get(id).cloned()
    }

    /// All Stores, ordered by id
    pub fn list(&self) -> Vec<StoreInfo> {
        self.stores.read().values().cloned().collect()
    }

    /// Healthy Stores, ordered by id
    pub fn healthy(&self) -> Vec<StoreInfo> {
        self.stores
            .read()
            .values()
            .filter(|s| s.is_healthy())
            .cloned()
            .collect()
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
