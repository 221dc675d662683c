//! Timeline routing and placement
//!
//! A timeline key maps to its owner on the consistent-hash ring. When the
//! owner is unhealthy or loaded past the configured threshold, the best
//! scoring healthy Store among the next distinct ring successors is used.

use parking_lot::RwLock;
use std::sync::Arc;

use strand_core::{PlacementPolicy, Result, RouterConfig, StoreId, StrandError, TimelineKey};

use crate::registry::{StoreInfo, StoreLoad, StoreRegistry};
use crate::ring::HashRing;

// Composite score weights
const CAPACITY_WEIGHT: f64 = 0.3;
const CPU_WEIGHT: f64 = 0.25;
const MEMORY_WEIGHT: f64 = 0.25;
const LATENCY_WEIGHT: f64 = 0.2;

/// Composite placement score in `[0, 1]`, higher is better
pub fn composite_score(load: &StoreLoad) -> f64 {
    let unit = |v: f64| v.clamp(0.0, 1.0);
    CAPACITY_WEIGHT * (1.0 - unit(load.capacity_ratio()))
        + CPU_WEIGHT * (1.0 - unit(load.cpu_usage))
        + MEMORY_WEIGHT * (1.0 - unit(load.mem_usage))
        + LATENCY_WEIGHT * (1.0 / (1.0 + load.latency_ms.max(0.0) / 1000.0))
}

/// Maps timeline keys to hosting Stores
#[derive(Debug)]
pub struct Router {
    config: RouterConfig,
    registry: Arc<StoreRegistry>,
    ring: RwLock<HashRing>,
}

impl Router {
    /// Router over the Stores of `registry`; Stores join the ring through
    /// [`Router::add_store`]
    pub fn new(config: RouterConfig, registry: Arc<StoreRegistry>) -> Self {
        let ring = HashRing::new(config.virtual_nodes);
        Self {
            config,
            registry,
            ring: RwLock::new(ring),
        }
    }

    /// The registry the router reads health and load from
    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    /// Routing configuration
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Put a Store on the ring
    pub fn add_store(&self, store: &StoreId) {
        self.ring.write().add(store);
        tracing::debug!(store = %store, "store added to ring");
    }

    /// Take a Store off the ring
    pub fn remove_store(&self, store: &StoreId) {
        self.ring.write().remove(store);
        tracing::debug!(store = %store, "store removed from ring");
    }

    /// Ring owner followed by up to `fallback_candidates` distinct successors
    pub fn candidates(&self, key: &TimelineKey) -> Vec<StoreId> {
        self.ring
            .read()
            .successors(&key.to_string(), 1 + self.config.fallback_candidates)
    }

    /// Store a timeline routes to under the current topology and load
    pub fn route_timeline(&self, key: &TimelineKey) -> Result<StoreId> {
        let candidates = self.candidates(key);
        let Some(primary) = candidates.first() else {
            return Err(StrandError::unavailable("no stores on the ring"));
        };

        let primary_info = self.registry.get(primary);
        if let Some(info) = &primary_info {
            if info.is_healthy() && self.load_of(info) <= self.config.load_threshold {
                return Ok(primary.clone());
            }
        }

        let fallback = best_scoring(
            candidates[1..]
                .iter()
                .filter_map(|id| self.registry.get(id))
                .filter(StoreInfo::is_healthy),
        );
        match (fallback, primary_info) {
            (Some(info), _) => {
                tracing::debug!(key = %key, primary = %primary, fallback = %info.id, "routing to fallback store");
                Ok(info.id)
            }
            (None, Some(info)) if info.is_healthy() => Ok(info.id),
            _ => Err(StrandError::unavailable(format!(
                "no healthy store for {key}"
            ))),
        }
    }

    /// Store a brand-new timeline should be created on
    pub fn place_new_timeline(&self, key: &TimelineKey) -> Result<StoreId> {
        let healthy = || {
            let ring = self.ring.read();
            self.registry
                .healthy()
                .into_iter()
                .filter(|info| ring.contains(&info.id))
                .collect::<Vec<_>>()
        };
        let chosen = match self.config.placement_policy {
            PlacementPolicy::HashRing => return self.route_timeline(key),
            PlacementPolicy::LeastLoaded => best_scoring(healthy().into_iter()),
            PlacementPolicy::LeastStorage => {
                healthy()
                    .into_iter()
                    .fold(None, |best: Option<StoreInfo>, info| match best {
                        Some(b) if b.load.capacity_ratio() <= info.load.capacity_ratio() => Some(b),
                        _ => Some(info),
                    })
            }
        };
        chosen
            .map(|info| info.id)
            .ok_or_else(|| StrandError::unavailable(format!("no healthy store for {key}")))
    }

    fn load_of(&self, info: &StoreInfo) -> f64 {
        1.0 - composite_score(&info.load)
    }
}

/// Highest composite score; the earliest candidate wins ties
fn best_scoring(candidates: impl Iterator<Item = StoreInfo>) -> Option<StoreInfo> {
    candidates.fold(None, |best: Option<(f64, StoreInfo)>, info| {
        let score = composite_score(&info.load);
        match best {
            Some((best_score, b)) if best_score >= score => Some((best_score, b)),
            _ => Some((score, info)),
        }
    })
    .map(|(_, info)| info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::ManualClock;

    fn router(stores: &[&str], config: RouterConfig) -> Router {
        let registry = Arc::new(StoreRegistry::new(ManualClock::new(0)));
        let router = Router::new(config, registry.clone());
        for s in stores {
            registry.register(StoreInfo::new(*s, ""));
            router.add_store(&StoreId::new(*s));
        }
        router
    }

    fn overloaded() -> StoreLoad {
        StoreLoad {
            used_capacity: 100,
            max_capacity: 100,
            cpu_usage: 1.0,
            mem_usage: 1.0,
            latency_ms: 10_000.0,
            ..StoreLoad::default()
        }
    }

    #[test]
    fn test_composite_score_bounds() {
        assert!((composite_score(&StoreLoad::default()) - 1.0).abs() < 1e-9);
        assert!(composite_score(&overloaded()) < 0.05);
    }

    #[test]
    fn test_route_is_stable() {
        let router = router(&["s1", "s2", "s3"], RouterConfig::default());
        let key = TimelineKey::conversation("k");
        let first = router.route_timeline(&key).unwrap();
        for _ in 0..20 {
            assert_eq!(router.route_timeline(&key).unwrap(), first);
        }
    }

    #[test]
    fn test_overloaded_primary_falls_back() {
        let router = router(&["s1", "s2", "s3"], RouterConfig::default());
        let key = TimelineKey::conversation("k");
        let candidates = router.candidates(&key);
        let primary = candidates[0].clone();

        router.registry().heartbeat(&primary, overloaded()).unwrap();
        let routed = router.route_timeline(&key).unwrap();
        assert_ne!(routed, primary);
        assert_eq!(routed, candidates[1], "ties go to ring order");

        router.registry().heartbeat(&primary, StoreLoad::default()).unwrap();
        router.registry().mark_unhealthy(&candidates[1]).unwrap();
        assert_eq!(router.route_timeline(&key).unwrap(), primary);
    }

    #[test]
    fn test_unhealthy_everywhere_is_unavailable() {
        let router = router(&["s1"], RouterConfig::default());
        router.registry().mark_unhealthy(&StoreId::new("s1")).unwrap();
        assert!(matches!(
            router.route_timeline(&TimelineKey::inbox("bob")),
            Err(StrandError::Unavailable { .. })
        ));
        let empty = router_with_no_stores();
        assert!(empty.route_timeline(&TimelineKey::inbox("bob")).is_err());
    }

    fn router_with_no_stores() -> Router {
        router(&[], RouterConfig::default())
    }

    #[test]
    fn test_placement_policies() {
        let mut config = RouterConfig::default();
        config.placement_policy = PlacementPolicy::LeastStorage;
        let router = router(&["s1", "s2", "s3"], config);
        let registry = router.registry();
        let with_usage = |used| StoreLoad {
            used_capacity: used,
            max_capacity: 100,
            ..StoreLoad::default()
        };
        registry.heartbeat(&StoreId::new("s1"), with_usage(50)).unwrap();
        registry.heartbeat(&StoreId::new("s2"), with_usage(10)).unwrap();
        registry.heartbeat(&StoreId::new("s3"), with_usage(30)).unwrap();
        assert_eq!(
            router.place_new_timeline(&TimelineKey::conversation("new")).unwrap(),
            StoreId::new("s2")
        );

        let mut config = RouterConfig::default();
        config.placement_policy = PlacementPolicy::LeastLoaded;
        let router = router_like(router, config);
        router
            .registry()
            .heartbeat(
                &StoreId::new("s2"),
                StoreLoad {
                    cpu_usage: 0.9,
                    ..with_usage(10)
                },
            )
            .unwrap();
        assert_eq!(
            router.place_new_timeline(&TimelineKey::conversation("new")).unwrap(),
            StoreId::new("s3")
        );
    }

    fn router_like(other: Router, config: RouterConfig) -> Router {
        let router = Router::new(config, other.registry().clone());
        for info in other.registry().list() {
            router.add_store(&info.id);
        }
        router
    }
}
