//! # Strand Shard
//!
//! **Purpose**: the cluster-facing surface of Strand.
//!
//! - [`ShardManager`]: transactional create/append/delete, locked reads,
//!   health and load refresh, rebalancing and migration entry points
//! - [`MigrationManager`]: cancellable background moves of a timeline
//!   between Stores
//! - [`StoreParticipant`]: transaction participant over a
//!   [`strand_core::TimelineService`]
//! - [`StoreDirectory`]: live Store handles by id
//!
//! Stores are reached only through `TimelineService`, so in-process stores
//! and remote stores mix freely in one cluster.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod directory;
pub mod manager;
pub mod migration;
pub mod participant;

pub use directory::StoreDirectory;
pub use manager::ShardManager;
pub use migration::{MigrationId, MigrationManager, MigrationStatus, MigrationTask};
pub use participant::StoreParticipant;
