use super::memory::SetStore;
use crate::coordination::SourceDescriptor;
use crate::error::{CacheError, Result};
use crate::filter::MembershipFilter;
use crate::routing::{ShardIndex, ShardRouter};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::info;

/// A line-oriented store the bulk loader reads records from. One line is one record.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn open(&self, path: &str) -> std::io::Result<Box<dyn AsyncBufRead + Send + Unpin>>;
}

/// Reads records from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSource;

#[async_trait]
impl RecordSource for FileSource {
    async fn open(&self, path: &str) -> std::io::Result<Box<dyn AsyncBufRead + Send + Unpin>> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Box::new(BufReader::new(file)))
    }
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub store: SetStore,
    pub filter: MembershipFilter,
    /// Lines read from the source.
    pub read: u64,
    /// Records this shard owns and kept.
    pub added: u64,
    pub elapsed: Duration,
}

/// Expected records per shard: every record lands on `min(R, N)` of `N` shards.
pub fn records_per_shard(approx_records: u64, shard_count: usize, replication: usize) -> u64 {
    if shard_count == 0 {
        return 0;
    }
    let replicas = replication.min(shard_count) as u64;
    approx_records
        .saturating_mul(replicas)
        .div_ceil(shard_count as u64)
        .max(1)
}

/// Reads the whole source and keeps the records owned by `shard`, training a
/// filter sized for this shard's share as it goes.
pub async fn bulk_load(
    source: &dyn RecordSource,
    descriptor: &SourceDescriptor,
    router: &ShardRouter,
    shard: ShardIndex,
    shard_count: usize,
    replication: usize,
) -> Result<LoadOutcome> {
    let started = Instant::now();
    let mut filter = MembershipFilter::with_rate(
        records_per_shard(descriptor.approx_records, shard_count, replication),
        descriptor.false_positive_rate,
    )?;
    let store = SetStore::new();

    let reader = source
        .open(&descriptor.path)
        .await
        .map_err(|e| CacheError::LoadFailed(format!("cannot open {}: {}", descriptor.path, e)))?;

    let mut lines = reader.lines();
    let (mut read, mut added) = (0u64, 0u64);
    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| CacheError::LoadFailed(format!("reading {}: {}", descriptor.path, e)))?;
        let Some(line) = line else { break };

        let record = line.trim_end_matches('\r');
        if record.is_empty() {
            continue;
        }
        read += 1;

        if router.is_owner(shard, record, shard_count, replication) && store.add(record) {
            filter.train(record);
            added += 1;
        }
    }

    let elapsed = started.elapsed();
    info!(
        "Shard {} loaded {}: {} records read, {} kept, took {:?}",
        shard, descriptor.path, read, added, elapsed
    );

    Ok(LoadOutcome {
        store,
        filter,
        read,
        added,
        elapsed,
    })
}
