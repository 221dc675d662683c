//! # Strand Placement
//!
//! **Purpose**: decide which Store hosts a timeline.
//!
//! - [`StoreRegistry`]: liveness and load of every Store, with change events
//! - [`HashRing`]: consistent hashing with virtual nodes
//! - [`Router`]: ring lookup with load-aware fallback and new-timeline placement
//! - [`plan_rebalance`]: pairwise load-factor balancing proposals

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod rebalance;
pub mod registry;
pub mod ring;
pub mod router;

pub use rebalance::{estimated_gain, plan_rebalance, RebalanceProposal};
pub use registry::{RegistryEvent, StoreInfo, StoreLoad, StoreRegistry, StoreStatus};
pub use ring::HashRing;
pub use router::{composite_score, Router};
