//! Rebalance planning
//!
//! Stores are ranked by load factor (`max(timeline ratio, capacity ratio)`)
//! and paired from the outside in: most loaded with least loaded, second
//! with second, and so on. Each Store appears in at most one pair per cycle,
//! so one cycle never proposes two moves touching the same Store.

use serde::{Deserialize, Serialize};

use strand_core::{RebalanceConfig, StoreId};

use crate::registry::{StoreInfo, StoreLoad};
use crate::router::Router;

/// Recommendation to move one timeline between two Stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceProposal {
    /// Overloaded Store to take a timeline from
    pub from: StoreId,
    /// Underloaded Store to move it to
    pub to: StoreId,
    /// Load factor of `from` when planned
    pub from_load: f64,
    /// Load factor of `to` when planned
    pub to_load: f64,
    /// Estimated reduction of the pair's load-factor gap
    pub estimated_gain: f64,
}

/// Plan moves for one cycle over `stores`; only healthy Stores take part
pub fn plan_rebalance(stores: &[StoreInfo], config: &RebalanceConfig) -> Vec<RebalanceProposal> {
    let mut ranked: Vec<&StoreInfo> = stores.iter().filter(|s| s.is_healthy()).collect();
    ranked.sort_by(|a, b| {
        b.load
            .load_factor()
            .total_cmp(&a.load.load_factor())
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut proposals = Vec::new();
    let (mut hi, mut lo) = (0, ranked.len());
    while hi + 1 < lo {
        lo -= 1;
        let (from, to) = (ranked[hi], ranked[lo]);
        hi += 1;

        let from_load = from.load.load_factor();
        let to_load = to.load.load_factor();
        if from_load - to_load <= config.min_gap || from.load.timeline_count == 0 {
            continue;
        }
        let gain = estimated_gain(&from.load, &to.load);
        if gain <= config.min_gain {
            tracing::debug!(
                from = %from.id,
                to = %to.id,
                gain,
                "rebalance gain below threshold"
            );
            continue;
        }
        tracing::info!(
            from = %from.id,
            to = %to.id,
            from_load,
            to_load,
            gain,
            "rebalance proposed"
        );
        proposals.push(RebalanceProposal {
            from: from.id.clone(),
            to: to.id.clone(),
            from_load,
            to_load,
            estimated_gain: gain,
        });
    }
    proposals
}

/// Gap reduction from moving one average-sized timeline from `from` to `to`
pub fn estimated_gain(from: &StoreLoad, to: &StoreLoad) -> f64 {
    if from.timeline_count == 0 {
        return 0.0;
    }
    let avg_size = from.used_capacity / from.timeline_count;
    let after_from = StoreLoad {
        timeline_count: from.timeline_count - 1,
        used_capacity: from.used_capacity.saturating_sub(avg_size),
        ..*from
    };
    let after_to = StoreLoad {
        timeline_count: to.timeline_count + 1,
        used_capacity: to.used_capacity + avg_size,
        ..*to
    };
    let before = (from.load_factor() - to.load_factor()).abs();
    let after = (after_from.load_factor() - after_to.load_factor()).abs();
    before - after
}

impl Router {
    /// Rebalance proposals for the Stores currently in the registry
    pub fn plan_rebalance(&self, config: &RebalanceConfig) -> Vec<RebalanceProposal> {
        plan_rebalance(&self.registry().list(), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StoreStatus;

    fn store(id: &str, timelines: u64, used: u64) -> StoreInfo {
        StoreInfo::new(id, "").with_load(StoreLoad {
            timeline_count: timelines,
            max_timelines: 10,
            used_capacity: used,
            max_capacity: 100,
            ..StoreLoad::default()
        })
    }

    #[test]
    fn test_hot_store_sheds_to_cold_store() {
        let stores = vec![store("hot", 9, 90), store("cold", 3, 30)];
        let proposals = plan_rebalance(&stores, &RebalanceConfig::default());
        assert_eq!(proposals.len(), 1);
        let p = &proposals[0];
        assert_eq!(p.from, StoreId::new("hot"));
        assert_eq!(p.to, StoreId::new("cold"));
        assert!((p.from_load - 0.9).abs() < 1e-9);
        assert!((p.to_load - 0.3).abs() < 1e-9);
        assert!((p.estimated_gain - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_small_gap_is_left_alone() {
        let stores = vec![store("a", 5, 50), store("b", 4, 40)];
        assert!(plan_rebalance(&stores, &RebalanceConfig::default()).is_empty());
    }

    #[test]
    fn test_low_gain_is_rejected() {
        // One huge timeline: moving it would just swap the imbalance
        let stores = vec![store("a", 1, 90), store("b", 0, 0)];
        let config = RebalanceConfig::default();
        assert!(estimated_gain(&stores[0].load, &stores[1].load) <= config.min_gain);
        assert!(plan_rebalance(&stores, &config).is_empty());
    }

    #[test]
    fn test_each_store_paired_once() {
        let stores = vec![
            store("a", 9, 90),
            store("b", 8, 80),
            store("c", 1, 10),
            store("d", 2, 20),
            store("e", 5, 50),
        ];
        let proposals = plan_rebalance(&stores, &RebalanceConfig::default());
        let pairs: Vec<(&str, &str)> = proposals
            .iter()
            .map(|p| (p.from.as_str(), p.to.as_str()))
            .collect();
        assert_eq!(pairs, vec![("a", "c"), ("b", "d")]);
    }

    #[test]
    fn test_unhealthy_stores_are_ignored() {
        let mut cold = store("cold", 0, 0);
        cold.status = StoreStatus::Unhealthy;
        let stores = vec![store("hot", 9, 90), cold];
        assert!(plan_rebalance(&stores, &RebalanceConfig::default()).is_empty());
    }
}
