//! # Strand Core - Foundation
//!
//! **Purpose**: identifiers, records, errors, configuration and runtime
//! plumbing shared by every Strand crate.
//!
//! Strand is a shard-aware, append-only timeline storage engine: ordered
//! message streams (one per conversation, one per user inbox) live in
//! size-bounded blocks on capacity-bounded Stores, and cross-store operations
//! are coordinated with leases and a prepare/commit protocol.
//!
//! # Architecture Constraints
//!
//! This crate depends on no other Strand crate.
//! - YES Domain identifiers and message records
//! - YES The `TimelineService` seam between coordinators and Stores
//! - YES Unified error type, configuration, clocks, task registry
//! - NO storage engine (that's `strand-store`)
//! - NO placement or coordination logic

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Configuration sections and loading
pub mod config;

/// Unified error type
pub mod errors;

/// Store-facing service trait
pub mod service;

/// Background task registry
#[allow(missing_docs)]
pub mod tasks;

/// Physical clocks
pub mod time;

/// Identifiers, records and request shapes
pub mod types;

pub use config::{
    CommitPolicy, DurabilityMode, IndexConfig, LockConfig, MigrationConfig, PlacementPolicy,
    RebalanceConfig, RegistryConfig, RouterConfig, RpcConfig, StoreConfig, StrandConfig,
    TransactionConfig,
};
pub use errors::{ErrorCode, Result, StrandError};
pub use service::TimelineService;
pub use tasks::TaskRegistry;
pub use time::{now_ms, ManualClock, PhysicalClock, SharedClock, SystemClock};
pub use types::{
    AppendReceipt, AppendRequest, BlockId, BlockInfo, BlockPlacement, BlockSnapshot, BlockState,
    HealthReport, HealthStatus, Message, MessageCursor, MessageQuery, SeqId, StoreId, StoreStats,
    TimelineInfo, TimelineKey, TimelineType,
};
