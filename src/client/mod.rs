//! Cache Client Module
//!
//! The caller's side of the cache: one `CacheClient` per collection, holding
//! one `ShardClient` connection per shard.
//!
//! ## Core Concepts
//! - **Replica fallback**: keyed operations walk the key's replica set in
//!   order, skipping shards that are down, until one answers.
//! - **Filter fast path**: for static collections each shard's membership
//!   filter is consulted first; a miss answers without a round trip.
//! - **Failure accounting**: a replica that is down or fails counts against
//!   the budget of `min(R, N)`. Exhausting it raises `Unavailable` instead of
//!   returning a false negative.
//! - **Reconnect**: a closed link gets exactly one reconnect attempt before
//!   the shard is counted as failed.

pub mod connection;
pub mod orchestrator;

pub use connection::{RetryPolicy, ShardClient, ShardStream};
pub use orchestrator::{CacheClient, CollectionScan, NegativePolicy};
