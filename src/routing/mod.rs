//! Shard Routing Module
//!
//! Maps a key to the ordered set of shards that own it.
//!
//! ## Core Concepts
//! - **Replica set**: `route(key, N, R)` returns `min(R, N)` distinct shard indices,
//!   primary first. Every client computes the same set without coordination.
//! - **Strategy**: The hash function is pluggable (`HashStrategy`) and resolved once
//!   when the router is built from configuration.

pub mod router;

pub use router::{Blake3Strategy, HashKind, HashStrategy, Sha256Strategy, ShardRouter};

/// Index of a shard inside a collection, `0..shard_count`.
pub type ShardIndex = usize;
