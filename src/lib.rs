//! Replicated Shard Set Cache Library
//!
//! This library crate defines the modules of a distributed, in-memory set and
//! map-set cache. Each collection is split into N shards, every record lives on
//! R of them, and clients route around shards that are down.
//! It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! - **`routing`**: Deterministic key → replica set mapping with a pluggable hash.
//! - **`availability`**: Per-client view of which shards are up, kept in sync with
//!   the coordination service through a background watch.
//! - **`filter`**: Bloom filters that let clients skip round trips for absent records.
//! - **`protocol`**: The big-endian framed wire protocol between clients and shards.
//! - **`client`**: Shard connections and the request orchestrator (`CacheClient`).
//! - **`server`**: Shard workers: accept loop, dispatch, heartbeat, status endpoint.
//! - **`storage`**: Concurrent local stores and the bulk loader.
//! - **`coordination`**: The coordination contract, an in-process implementation,
//!   collection administration and the safety net.
//! - **`config`** and **`error`**: Runtime settings and the error taxonomy.

pub mod availability;
pub mod client;
pub mod config;
pub mod coordination;
pub mod error;
pub mod filter;
pub mod protocol;
pub mod routing;
pub mod server;
pub mod storage;

pub use client::CacheClient;
pub use error::{CacheError, Result};
