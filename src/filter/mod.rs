//! Membership Filter Module
//!
//! A Bloom filter summarising the records a shard holds. Shards train it during
//! bulk load; clients download one copy per shard and consult it before paying
//! for a network `contains`.
//!
//! A negative answer is definitive, a positive answer only means "maybe" and
//! still needs a confirming round trip.

pub mod bloom;

pub use bloom::{FilterError, MembershipFilter};

#[cfg(test)]
mod tests;
