//! Consistent-hash ring with virtual nodes

use std::collections::BTreeMap;

use strand_core::StoreId;

/// Position on the ring
pub fn ring_hash(input: &str) -> u64 {
    let hash = blake3::hash(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Hash ring: virtual node position -> Store
#[derive(Debug, Clone)]
pub struct HashRing {
    virtual_nodes: usize,
    ring: BTreeMap<u64, StoreId>,
}

impl HashRing {
    /// Empty ring placing `virtual_nodes` positions per Store
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            ring: BTreeMap::new(),
        }
    }

    /// Add a Store's virtual nodes; adding twice is a no-op
    pub fn add(&mut self, store: &StoreId) {
        for i in 0..self.virtual_nodes {
            self.ring
                .entry(ring_hash(&format!("{store}#{i}")))
                .or_insert_with(|| store.clone());
        }
    }

    /// Remove a Store's virtual nodes
    pub fn remove(&mut self, store: &StoreId) {
        self.ring.retain(|_, owner| owner != store);
    }

    /// Whether the Store has positions on the ring
    pub fn contains(&self, store: &StoreId) -> bool {
        self.ring.values().any(|owner| owner == store)
    }

    /// Number of distinct Stores on the ring
    pub fn store_count(&self) -> usize {
        let mut stores: Vec<&StoreId> = self.ring.values().collect();
        stores.sort();
        stores.dedup();
        stores.len()
    }

    /// Owner of `key`: the first position at or after the key's hash
    pub fn owner(&self, key: &str) -> Option<&StoreId> {
        let hash = ring_hash(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, store)| store)
    }

    /// Up to `n` distinct Stores walking clockwise from the key's position;
    /// the first is the owner
    pub fn successors(&self, key: &str, n: usize) -> Vec<StoreId> {
        let hash = ring_hash(key);
        let mut out: Vec<StoreId> = Vec::with_capacity(n);
        for (_, store) in self.ring.range(hash..).chain(self.ring.range(..hash)) {
            if out.len() == n {
                break;
            }
            if !out.contains(store) {
                out.push(store.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(stores: &[&str]) -> HashRing {
        let mut ring = HashRing::new(150);
        for s in stores {
            ring.add(&StoreId::new(*s));
        }
        ring
    }

    #[test]
    fn test_successors_are_distinct_and_start_with_owner() {
        let ring = ring(&["s1", "s2", "s3"]);
        let succ = ring.successors("conv:c1", 5);
        assert_eq!(succ.len(), 3);
        assert_eq!(Some(&succ[0]), ring.owner("conv:c1"));
        assert_eq!(ring.store_count(), 3);
    }

    #[test]
    fn test_removal_only_moves_keys_of_removed_store() {
        let full = ring(&["s1", "s2", "s3", "s4"]);
        let mut reduced = full.clone();
        reduced.remove(&StoreId::new("s4"));
        assert!(!reduced.contains(&StoreId::new("s4")));

        for i in 0..500 {
            let key = format!("conv:k{i}");
            let before = full.owner(&key).cloned();
            let after = reduced.owner(&key).cloned();
            if before != Some(StoreId::new("s4")) {
                assert_eq!(before, after, "{key} moved");
            }
        }
    }

    #[test]
    fn test_keys_spread_over_stores() {
        let ring = ring(&["s1", "s2", "s3"]);
        let mut counts = std::collections::HashMap::new();
        for i in 0..3000 {
            *counts.entry(ring.owner(&format!("inbox:u{i}")).cloned()).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|c| *c > 500));
    }
}
