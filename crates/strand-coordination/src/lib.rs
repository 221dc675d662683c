//! # Strand Coordination
//!
//! **Purpose**: cross-Store agreement on where timelines live and who may
//! change them.
//!
//! - [`GlobalIndexManager`]: authoritative timeline location directory with
//!   idempotent mutators and bounded, lossy watch queues
//! - [`DistributedLockManager`]: single-process lease table with fencing tokens
//! - [`TransactionCoordinator`]: lease-guarded prepare/commit over
//!   [`ParticipantHandler`]s
//!
//! This crate knows nothing about how Stores persist data; participants are
//! reached only through [`ParticipantHandler`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod index;
pub mod locks;
pub mod transaction;

pub use index::{
    GlobalIndexManager, IndexChange, IndexEntry, IndexEvent, IndexWatcher, TimelineLocation,
};
pub use locks::{DistributedLock, DistributedLockManager};
pub use transaction::{
    DistributedTransaction, Operation, Participant, ParticipantHandler, ParticipantOutcome,
    ParticipantStatus, TransactionCoordinator, TransactionId, TransactionStatus,
};
