use super::ShardIndex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// A keyed hash with a perturbation round.
///
/// Implementations must be deterministic across processes and builds: two
/// clients hashing the same `(key, round)` must get the same value.
pub trait HashStrategy: Send + Sync + fmt::Debug {
    fn hash(&self, key: &[u8], round: u32) -> u64;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Strategy;

impl HashStrategy for Blake3Strategy {
    fn hash(&self, key: &[u8], round: u32) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&round.to_le_bytes());
        hasher.update(key);
        let digest = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(word)
    }

    fn name(&self) -> &'static str {
        "blake3"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Strategy;

impl HashStrategy for Sha256Strategy {
    fn hash(&self, key: &[u8], round: u32) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(round.to_le_bytes());
        hasher.update(key);
        let digest = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(word)
    }

    fn name(&self) -> &'static str {
        "sha256"
    }
}

/// Configuration-level name of a hash strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    #[default]
    Blake3,
    Sha256,
}

impl HashKind {
    pub fn strategy(self) -> Arc<dyn HashStrategy> {
        match self {
            HashKind::Blake3 => Arc::new(Blake3Strategy),
            HashKind::Sha256 => Arc::new(Sha256Strategy),
        }
    }
}

impl std::str::FromStr for HashKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blake3" => Ok(HashKind::Blake3),
            "sha256" => Ok(HashKind::Sha256),
            other => Err(format!("unknown hash strategy: {}", other)),
        }
    }
}

/// Deterministic key → replica set mapping.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    strategy: Arc<dyn HashStrategy>,
}

impl ShardRouter {
    pub fn new(strategy: Arc<dyn HashStrategy>) -> Self {
        Self { strategy }
    }

    pub fn from_kind(kind: HashKind) -> Self {
        Self::new(kind.strategy())
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Returns `min(replication, shard_count)` distinct shard indices for `key`,
    /// primary first.
    ///
    /// The first index is `hash(key, 0) % N`. Each further replica takes the next
    /// perturbation round and, when that index is taken, steps forward to the
    /// next free shard so the walk always terminates.
    pub fn route(&self, key: &str, shard_count: usize, replication: usize) -> Vec<ShardIndex> {
        let wanted = replication.min(shard_count);
        let mut chosen: Vec<ShardIndex> = Vec::with_capacity(wanted);
        if wanted == 0 {
            return chosen;
        }

        let mut round = 0u32;
        while chosen.len() < wanted {
            let mut candidate = (self.strategy.hash(key.as_bytes(), round) % shard_count as u64) as ShardIndex;
            while chosen.contains(&candidate) {
                candidate = (candidate + 1) % shard_count;
            }
            chosen.push(candidate);
            round = round.wrapping_add(1);
        }

        chosen
    }

    /// The shard a key is written to when every replica is up.
    pub fn primary(&self, key: &str, shard_count: usize) -> Option<ShardIndex> {
        self.route(key, shard_count, 1).first().copied()
    }

    /// Whether `shard` is in the replica set of `key`.
    pub fn is_owner(&self, shard: ShardIndex, key: &str, shard_count: usize, replication: usize) -> bool {
        self.route(key, shard_count, replication).contains(&shard)
    }
}

impl Default for ShardRouter {
    fn default() -> Self {
        Self::from_kind(HashKind::default())
    }
}
