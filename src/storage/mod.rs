//! Local Storage Module
//!
//! The in-process backend behind each shard.
//!
//! ## Core Concepts
//! - **SetStore / MapSetStore / TripleStore**: concurrent collections on
//!   `dashmap`; each operation is atomic with respect to the others.
//! - **Bulk load**: a static collection reads its whole source, keeps only the
//!   records this shard owns and trains the shard's membership filter.

pub mod bulk;
pub mod memory;
pub mod triple;

pub use bulk::{bulk_load, records_per_shard, FileSource, LoadOutcome, RecordSource};
pub use memory::{LocalStore, MapSetStore, SetStore};
pub use triple::{Triple, TriplePrefix, TripleStore};
