//! Services of the Stores the manager can reach

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use strand_core::{Result, StoreId, StrandError, TimelineService};

/// Registered `TimelineService` per Store, local or remote
#[derive(Default)]
pub struct StoreDirectory {
    services: RwLock<BTreeMap<StoreId, Arc<dyn TimelineService>>>,
}

impl std::fmt::Debug for StoreDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.services.read().keys()).finish()
    }
}

impl StoreDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the service of `service.store_id()`
    pub fn insert(&self, service: Arc<dyn TimelineService>) {
        self.services
            .write()
            .insert(service.store_id().clone(), service);
    }

    /// Remove a Store's service
    pub fn remove(&self, id: &StoreId) -> Option<Arc<dyn TimelineService>> {
        self.services.write().remove(id)
    }

    /// Service of one Store
    pub fn get(&self, id: &StoreId) -> Result<Arc<dyn TimelineService>> {
        self.services
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StrandError::not_found(format!("store {id}")))
    }

    /// Every Store with its service, ordered by id
    pub fn all(&self) -> Vec<(StoreId, Arc<dyn TimelineService>)> {
        self.services
            .read()
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect()
    }

    /// Registered Store ids, ordered
    pub fn ids(&self) -> Vec<StoreId> {
        self.services.read().keys().cloned().collect()
    }
}
