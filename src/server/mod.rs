//! Shard Server Module
//!
//! The process side of a shard: accepts client connections, answers requests
//! from local storage and keeps the coordination service informed.
//!
//! ## Core Concepts
//! - **Connection tasks**: one tokio task per client link; requests and
//!   responses strictly alternate.
//! - **Dispatch**: `ShardState::dispatch` maps a request to a single reply, a
//!   record stream, or a shutdown.
//! - **Heartbeat**: an ephemeral status node the safety net checks for freshness.
//! - **Reload**: static collections reload when a new source generation is published.

pub mod heartbeat;
pub mod http;
pub mod worker;

pub use heartbeat::Heartbeat;
pub use worker::{Reply, ShardState, ShardWorker, ShutdownHandle};

#[cfg(test)]
mod tests;
