//! Coordination Module
//!
//! The contract this crate consumes from the coordination service, plus an
//! in-process implementation and the administrative operations built on it.
//!
//! ## Node Layout
//! - `<root>/<name>`: bincode `CollectionInfo`, including the availability bitmap.
//! - `<root>/<name>.lock`: ephemeral, held while the metadata is mutated.
//! - `<root>/<name>/shards/<index>`: ephemeral `ShardStatus`, refreshed by each worker.
//!
//! ## Core Concepts
//! - **Watches**: one-shot; a reader re-arms by reading again.
//! - **Safety net**: turns stale or missing shard status into cleared bitmap bits.

pub mod admin;
pub mod memory;
pub mod safety_net;
pub mod service;
pub mod types;

pub use admin::CollectionAdmin;
pub use memory::MemoryCoordinator;
pub use safety_net::SafetyNet;
pub use service::{CoordinationError, Coordinator, NodeMode, Watch, WatchEvent, WatchEventKind};
pub use types::{
    collection_path, lock_path, now_ms, shard_path, shards_path, AvailabilityBitmap,
    CollectionInfo, CollectionKind, ShardStatus, SourceDescriptor,
};

#[cfg(test)]
mod tests;
