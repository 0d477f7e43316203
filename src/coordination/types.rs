use super::service::CoordinationError;
use crate::routing::ShardIndex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionKind {
    /// Bulk-loaded from a source, filter-backed, read-only to clients.
    StaticSet,
    DynamicSet,
    /// Key → set of values.
    MapSet,
    /// Three-field records with prefix scans.
    TripleSet,
}

impl CollectionKind {
    pub fn is_map(self) -> bool {
        matches!(self, CollectionKind::MapSet)
    }

    pub fn is_triple(self) -> bool {
        matches!(self, CollectionKind::TripleSet)
    }

    /// Kinds whose records are single strings.
    pub fn is_plain_set(self) -> bool {
        matches!(self, CollectionKind::StaticSet | CollectionKind::DynamicSet)
    }

    pub fn has_filter(self) -> bool {
        matches!(self, CollectionKind::StaticSet)
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, CollectionKind::StaticSet)
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollectionKind::StaticSet => "static-set",
            CollectionKind::DynamicSet => "dynamic-set",
            CollectionKind::MapSet => "map-set",
            CollectionKind::TripleSet => "triple-set",
        };
        f.write_str(name)
    }
}

impl FromStr for CollectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "static-set" | "static" | "set" => Ok(CollectionKind::StaticSet),
            "dynamic-set" | "dynamic" => Ok(CollectionKind::DynamicSet),
            "map-set" | "map" | "mapset" => Ok(CollectionKind::MapSet),
            "triple-set" | "triple" | "triples" => Ok(CollectionKind::TripleSet),
            other => Err(format!("unknown collection kind {:?}", other)),
        }
    }
}

/// One bit per shard, packed LSB-first into bytes. A set bit means the shard is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityBitmap {
    bits: Vec<u8>,
    len: usize,
}

impl AvailabilityBitmap {
    pub fn all_down(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
        }
    }

    pub fn all_up(len: usize) -> Self {
        let mut bitmap = Self::all_down(len);
        for shard in 0..len {
            bitmap.set(shard, true);
        }
        bitmap
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Out-of-range shards read as down.
    pub fn is_up(&self, shard: ShardIndex) -> bool {
        shard < self.len
            && self
                .bits
                .get(shard / 8)
                .is_some_and(|byte| byte & (1 << (shard % 8)) != 0)
    }

    /// Whether the packed bytes cover exactly `len` bits. Decoded bitmaps
    /// must be checked before use.
    pub fn is_well_formed(&self) -> bool {
        self.bits.len() == self.len.div_ceil(8)
    }

    /// Returns whether the bit changed. Out-of-range shards are ignored.
    pub fn set(&mut self, shard: ShardIndex, up: bool) -> bool {
        if shard >= self.len {
            return false;
        }
        let before = self.is_up(shard);
        let Some(byte) = self.bits.get_mut(shard / 8) else {
            return false;
        };
        let mask = 1 << (shard % 8);
        if up {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
        before != up
    }

    pub fn up_count(&self) -> usize {
        (0..self.len).filter(|&shard| self.is_up(shard)).count()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

/// Where a static collection is bulk-loaded from. A new `generation` tells
/// every worker to reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub path: String,
    pub approx_records: u64,
    pub false_positive_rate: f64,
    pub generation: u64,
}

/// Collection metadata stored as the data of `<root>/<name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub kind: CollectionKind,
    pub shard_count: usize,
    pub replication: usize,
    pub availability: AvailabilityBitmap,
    pub source: Option<SourceDescriptor>,
    pub port: u16,
}

impl CollectionInfo {
    pub fn new(name: &str, kind: CollectionKind, shard_count: usize, replication: usize, port: u16) -> Self {
        Self {
            name: name.to_string(),
            kind,
            shard_count,
            replication,
            availability: AvailabilityBitmap::all_down(shard_count),
            source: None,
            port,
        }
    }

    /// Number of replicas each key actually has.
    pub fn effective_replication(&self) -> usize {
        self.replication.min(self.shard_count)
    }

    /// Shards that must be up before a reload is considered complete.
    pub fn load_quorum(&self) -> usize {
        self.shard_count
            .saturating_sub(self.effective_replication().saturating_sub(1))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CoordinationError> {
        bincode::serialize(self).map_err(|e| CoordinationError::Decode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoordinationError> {
        let info: CollectionInfo =
            bincode::deserialize(bytes).map_err(|e| CoordinationError::Decode(e.to_string()))?;
        if info.availability.len() != info.shard_count {
            return Err(CoordinationError::Decode(format!(
                "bitmap covers {} shards, collection has {}",
                info.availability.len(),
                info.shard_count
            )));
        }
        if !info.availability.is_well_formed() {
            return Err(CoordinationError::Decode(format!(
                "bitmap of {} shards packed into {} bytes",
                info.availability.len(),
                info.availability.as_bytes().len()
            )));
        }
        Ok(info)
    }
}

/// Liveness record a worker keeps fresh at `<root>/<name>/shards/<index>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStatus {
    pub index: ShardIndex,
    pub address: String,
    pub size: u64,
    pub loading: bool,
    /// Source generation the shard's contents were loaded from, 0 if none.
    pub generation: u64,
    pub heartbeat_ms: u64,
}

impl ShardStatus {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoordinationError> {
        bincode::serialize(self).map_err(|e| CoordinationError::Decode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoordinationError> {
        bincode::deserialize(bytes).map_err(|e| CoordinationError::Decode(e.to_string()))
    }
}

pub fn collection_path(root: &str, name: &str) -> String {
    format!("{}/{}", root, name)
}

pub fn lock_path(root: &str, name: &str) -> String {
    format!("{}/{}.lock", root, name)
}

pub fn shards_path(root: &str, name: &str) -> String {
    format!("{}/{}/shards", root, name)
}

pub fn shard_path(root: &str, name: &str, shard: ShardIndex) -> String {
    format!("{}/{}/shards/{}", root, name, shard)
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
