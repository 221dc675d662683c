//! # Strand Store - Local Timeline Storage
//!
//! **Purpose**: durable, ordered, append-only persistence of timeline
//! messages into size-bounded blocks, with recovery after restart.
//!
//! # On-disk layout
//!
//! ```text
//! <data_dir>/
//!   conv_<id>.meta        JSON: id, type, lastSeqId, ordered blockIds
//!   inbox_<id>.meta
//!   checkpoints.json      per-user read checkpoints
//!   blocks/<block_id>.blk header + checksummed length-prefixed records
//! ```
//!
//! # Durability
//!
//! In [`DurabilityMode::WriteThrough`](strand_core::DurabilityMode) every
//! record is appended to its block file before the call returns and the file
//! is fsynced when the block seals. In `SealOnly` mode open blocks live in
//! memory until they seal or [`TimelineStore::flush`] runs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod block;
mod checkpoint;
pub mod codec;
mod files;
mod meta;
mod service;
mod store;
mod timeline;

pub use service::LocalStore;
pub use store::TimelineStore;
