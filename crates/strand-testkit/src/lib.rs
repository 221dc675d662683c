//! Strand Testing Infrastructure
//!
//! Shared fixtures for the Strand crates' tests: on-disk stores in temporary
//! directories, message builders, and `TimelineService` wrappers that inject
//! failures or hold calls until a test releases them.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]

pub mod fixtures;
pub mod services;

pub use fixtures::*;
pub use services::{FaultyService, Gate, GatedService, ServiceCall};

// Re-export the clock tests drive by hand
pub use strand_core::ManualClock;
