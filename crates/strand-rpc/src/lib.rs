//! # Strand RPC
//!
//! **Purpose**: the cross-store wire protocol.
//!
//! - [`protocol`]: request/response envelopes and per-method parameters
//! - [`RpcServer`]: axum server exposing one Store at `POST /rpc` and
//!   `GET /health`
//! - [`RemoteStore`]: reqwest client implementing
//!   [`strand_core::TimelineService`], so a coordinator drives remote Stores
//!   exactly like local ones
//!
//! Errors cross the wire as their stable code plus the serialized error and
//! are rebuilt into the same `StrandError` variant on the client.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod protocol;
pub mod server;

pub use client::RemoteStore;
pub use protocol::{RpcError, RpcMethod, RpcRequest, RpcResponse};
pub use server::RpcServer;
