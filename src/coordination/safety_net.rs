use super::admin::CollectionAdmin;
use super::service::CoordinationError;
use super::types::{now_ms, ShardStatus};
use crate::error::Result;
use crate::routing::ShardIndex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Periodically reconciles each collection's availability bitmap with the
/// shard status nodes the workers keep fresh.
///
/// A shard is down when its node is missing, its heartbeat is older than the
/// timeout, or it reports that it is loading. Otherwise it is up.
pub struct SafetyNet {
    admin: CollectionAdmin,
    timeout: Duration,
    interval: Duration,
}

impl SafetyNet {
    pub fn new(admin: CollectionAdmin, timeout: Duration, interval: Duration) -> Self {
        Self {
            admin,
            timeout,
            interval,
        }
    }

    async fn observed(&self, name: &str, shard: ShardIndex) -> Result<bool> {
        let path = self.admin.shard_path(name, shard);
        let data = match self.admin.coordinator().get(&path).await {
            Ok((data, _)) => data,
            Err(CoordinationError::NoNode(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let status = match ShardStatus::from_bytes(&data) {
            Ok(status) => status,
            Err(e) => {
                warn!("Unreadable status for shard {} of {}: {}", shard, name, e);
                return Ok(false);
            }
        };

        let age = now_ms().saturating_sub(status.heartbeat_ms);
        Ok(!status.loading && age <= self.timeout.as_millis() as u64)
    }

    /// Sweeps one collection and returns the shards whose bit was flipped.
    pub async fn sweep(&self, name: &str) -> Result<Vec<(ShardIndex, bool)>> {
        let info = self.admin.info(name).await?;

        let mut changes = Vec::new();
        for shard in 0..info.shard_count {
            let up = self.observed(name, shard).await?;
            if info.availability.is_up(shard) != up {
                changes.push((shard, up));
            }
        }

        if changes.is_empty() {
            return Ok(changes);
        }

        let apply = changes.clone();
        self.admin
            .update(name, move |info| {
                for (shard, up) in apply {
                    info.availability.set(shard, up);
                }
            })
            .await?;

        for (shard, up) in &changes {
            if *up {
                info!("Shard {} of {} is back", shard, name);
            } else {
                warn!("Shard {} of {} is stale, marking down", shard, name);
            }
        }
        Ok(changes)
    }

    /// Sweeps every collection under the root. Returns the number of flipped bits.
    pub async fn sweep_all(&self) -> Result<usize> {
        let mut flipped = 0;
        for name in self.admin.list().await? {
            match self.sweep(&name).await {
                Ok(changes) => flipped += changes.len(),
                Err(e) => warn!("Safety net sweep of {} failed: {}", name, e),
            }
        }
        Ok(flipped)
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Safety net running every {:?} with timeout {:?}",
                self.interval, self.timeout
            );
            let mut interval = tokio::time::interval(self.interval);
            loop {
                interval.tick().await;
                if let Err(e) = self.sweep_all().await {
                    warn!("Safety net sweep failed: {}", e);
                }
            }
        })
    }
}
