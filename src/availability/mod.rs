//! Availability Module
//!
//! Tracks which shards of a collection a client may talk to.
//!
//! ## Core Concepts
//! - **Local bit**: flipped by the client on I/O failure or successful reconnect.
//! - **Authoritative bit**: the coordination service's bitmap; wins whenever a
//!   new snapshot is applied.
//! - **Pending snapshot**: delivered by a background watch task, applied at the
//!   start of the next operation.

pub mod tracker;

pub use tracker::{AvailabilityTracker, ShardState};
