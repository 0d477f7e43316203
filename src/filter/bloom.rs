use serde::{Deserialize, Serialize};
use std::f64::consts::LN_2;
use thiserror::Error;

const MAX_HASHES: u32 = 32;
const FORMAT_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid filter parameters: {0}")]
    InvalidParameters(String),

    #[error("corrupt filter encoding: {0}")]
    Corrupt(String),
}

/// A Bloom filter sized analytically for an expected load and a target
/// false-positive probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipFilter {
    version: u8,
    words: Vec<u64>,
    bit_len: u64,
    hash_count: u32,
    trained: u64,
}

impl MembershipFilter {
    /// Creates an empty filter for `expected_records` at `false_positive_rate`.
    ///
    /// Bit length is `ceil(-n ln p / ln²2)` rounded up to whole 64-bit words and
    /// the hash count is `round(m / n · ln 2)`, both derived from the rounded size.
    pub fn with_rate(expected_records: u64, false_positive_rate: f64) -> Result<Self, FilterError> {
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(FilterError::InvalidParameters(format!(
                "false positive rate must be in (0, 1), got {}",
                false_positive_rate
            )));
        }

        let n = expected_records.max(1) as f64;
        let raw_bits = (-n * false_positive_rate.ln() / (LN_2 * LN_2)).ceil().max(1.0);
        let word_count = ((raw_bits / 64.0).ceil() as u64).max(1);
        let bit_len = word_count * 64;

        let hash_count = ((bit_len as f64 / n) * LN_2).round() as u32;
        let hash_count = hash_count.clamp(1, MAX_HASHES);

        tracing::debug!(
            "Sized membership filter: n={} p={} -> {} bits, {} hashes",
            expected_records,
            false_positive_rate,
            bit_len,
            hash_count
        );

        Ok(Self {
            version: FORMAT_VERSION,
            words: vec![0u64; word_count as usize],
            bit_len,
            hash_count,
            trained: 0,
        })
    }

    pub fn train(&mut self, item: &str) {
        let (h1, h2) = Self::base_hashes(item);
        for i in 0..self.hash_count as u64 {
            let bit = self.bit_index(h1, h2, i);
            self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.trained += 1;
    }

    /// `false` means definitely absent, `true` means maybe present.
    pub fn test(&self, item: &str) -> bool {
        let (h1, h2) = Self::base_hashes(item);
        (0..self.hash_count as u64).all(|i| {
            let bit = self.bit_index(h1, h2, i);
            self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
        })
    }

    pub fn len(&self) -> u64 {
        self.trained
    }

    pub fn is_empty(&self) -> bool {
        self.trained == 0
    }

    pub fn bit_len(&self) -> u64 {
        self.bit_len
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Expected false-positive probability at the current load.
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let k = self.hash_count as f64;
        let fill = 1.0 - (-(k * self.trained as f64) / self.bit_len as f64).exp();
        fill.powf(k)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FilterError> {
        bincode::serialize(self).map_err(|e| FilterError::Corrupt(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FilterError> {
        let filter: Self =
            bincode::deserialize(bytes).map_err(|e| FilterError::Corrupt(e.to_string()))?;

        if filter.version != FORMAT_VERSION {
            return Err(FilterError::Corrupt(format!(
                "unsupported format version {}",
                filter.version
            )));
        }
        if filter.bit_len == 0 || filter.words.len() as u64 * 64 != filter.bit_len {
            return Err(FilterError::Corrupt(format!(
                "bit length {} does not match {} words",
                filter.bit_len,
                filter.words.len()
            )));
        }
        if filter.hash_count == 0 || filter.hash_count > MAX_HASHES {
            return Err(FilterError::Corrupt(format!(
                "hash count {} out of range",
                filter.hash_count
            )));
        }

        Ok(filter)
    }

    fn base_hashes(item: &str) -> (u64, u64) {
        let digest = blake3::hash(item.as_bytes());
        let bytes = digest.as_bytes();
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&bytes[..8]);
        b.copy_from_slice(&bytes[8..16]);
        // Odd step keeps the index sequence from collapsing.
        (u64::from_le_bytes(a), u64::from_le_bytes(b) | 1)
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u64) -> u64 {
        h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_len
    }
}
