//! Error Taxonomy
//!
//! Typed failures surfaced by the cache client, the shard worker and the
//! coordination layer. Callers can tell "definitely not present" (`Ok(false)`)
//! apart from "could not determine" (`CacheError::Unavailable`).

use crate::coordination::CoordinationError;
use crate::filter::FilterError;
use crate::protocol::ProtocolError;
use crate::routing::ShardIndex;
use thiserror::Error;

/// Errors returned by collection-level operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Every shard owning the key is unreachable.
    #[error("all replicas for key {key:?} are unavailable")]
    Unavailable { key: String },

    /// Too many shards are unreachable to answer a collection-wide query.
    #[error("{unreachable} shards of {collection} are unreachable")]
    CollectionUnavailable { collection: String, unreachable: usize },

    /// The shard connection is closed. Recoverable by a single reconnect.
    #[error("shard {shard} is not connected")]
    NotConnected { shard: ShardIndex },

    /// The shard answered with a malformed or out-of-sequence frame.
    #[error("protocol violation on shard {shard}: {source}")]
    Protocol {
        shard: ShardIndex,
        #[source]
        source: ProtocolError,
    },

    /// Socket level failure while talking to a shard.
    #[error("i/o failure on shard {shard}: {source}")]
    Io {
        shard: ShardIndex,
        #[source]
        source: std::io::Error,
    },

    /// The shard understood the request but reported an error.
    #[error("shard {shard} returned an error: {message}")]
    Server { shard: ShardIndex, message: String },

    #[error("collection {0} is read-only")]
    ReadOnly(String),

    #[error("operation not supported by collection kind {0}")]
    UnsupportedKind(String),

    #[error("collection {0} does not exist")]
    CollectionNotFound(String),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("bulk load failed: {0}")]
    LoadFailed(String),
}

impl CacheError {
    /// Connection-fatal failures that mark a shard down and count against the
    /// replication budget.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            CacheError::Io { .. } | CacheError::Protocol { .. }
        )
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
