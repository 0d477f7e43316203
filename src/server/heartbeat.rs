use super::worker::ShardState;
use crate::coordination::{CollectionAdmin, CoordinationError, NodeMode};
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Keeps the shard's ephemeral status node fresh so the safety net can tell
/// a live shard from a dead one.
#[derive(Clone)]
pub struct Heartbeat {
    admin: CollectionAdmin,
    state: Arc<ShardState>,
    address: String,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(admin: CollectionAdmin, state: Arc<ShardState>, address: String, interval: Duration) -> Self {
        Self {
            admin,
            state,
            address,
            interval,
        }
    }

    fn path(&self) -> String {
        self.admin.shard_path(self.state.collection(), self.state.shard())
    }

    /// Writes the current status, creating the node if it does not exist yet.
    pub async fn beat(&self) -> Result<()> {
        let path = self.path();
        let data = self.state.status(&self.address).to_bytes()?;
        let coordinator = self.admin.coordinator();

        match coordinator.set_data(&path, data.clone(), None).await {
            Ok(_) => Ok(()),
            Err(CoordinationError::NoNode(_)) => {
                match coordinator.create(&path, data, NodeMode::Ephemeral).await {
                    Ok(()) | Err(CoordinationError::NodeExists(_)) => {
                        debug!("Shard {} registered at {}", self.state.shard(), path);
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = self.state.status_changed().notified() => {}
                }
                if let Err(e) = self.beat().await {
                    warn!("Shard {} heartbeat failed: {}", self.state.shard(), e);
                }
            }
        })
    }

    /// Deletes the status node on orderly shutdown.
    pub async fn remove(&self) {
        match self.admin.coordinator().delete(&self.path()).await {
            Ok(()) | Err(CoordinationError::NoNode(_)) => {}
            Err(e) => warn!("Shard {} could not remove its status: {}", self.state.shard(), e),
        }
    }
}
