use super::service::{CoordinationError, Coordinator, NodeMode};
use super::types::{
    collection_path, lock_path, shard_path, shards_path, CollectionInfo, CollectionKind,
    SourceDescriptor,
};
use crate::error::{CacheError, Result};
use crate::routing::ShardIndex;
use std::sync::Arc;
use tracing::{debug, info};

/// Administrative operations on collection metadata.
///
/// Every mutation runs while holding the collection's lock node, an ephemeral
/// sibling `<root>/<name>.lock`, so concurrent writers never lose updates.
#[derive(Clone)]
pub struct CollectionAdmin {
    coordinator: Arc<dyn Coordinator>,
    root: String,
}

impl CollectionAdmin {
    pub fn new(coordinator: Arc<dyn Coordinator>, root: impl Into<String>) -> Self {
        Self {
            coordinator,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }

    pub fn path(&self, name: &str) -> String {
        collection_path(&self.root, name)
    }

    async fn ensure_root(&self) -> Result<()> {
        match self
            .coordinator
            .create(&self.root, Vec::new(), NodeMode::Persistent)
            .await
        {
            Ok(()) | Err(CoordinationError::NodeExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn acquire_lock(&self, name: &str) -> Result<()> {
        let path = lock_path(&self.root, name);
        loop {
            match self
                .coordinator
                .create(&path, Vec::new(), NodeMode::Ephemeral)
                .await
            {
                Ok(()) => return Ok(()),
                Err(CoordinationError::NodeExists(_)) => {
                    let (held, watch) = self.coordinator.exists_and_watch(&path).await?;
                    if held {
                        debug!("Waiting for lock on {}", name);
                        if watch.fired().await.is_none() {
                            return Err(CoordinationError::SessionClosed.into());
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn release_lock(&self, name: &str) {
        if let Err(e) = self.coordinator.delete(&lock_path(&self.root, name)).await {
            tracing::warn!("Failed to release lock on {}: {}", name, e);
        }
    }

    fn not_found(&self, name: &str, error: CoordinationError) -> CacheError {
        match error {
            CoordinationError::NoNode(_) => CacheError::CollectionNotFound(name.to_string()),
            other => other.into(),
        }
    }

    pub async fn create(
        &self,
        name: &str,
        kind: CollectionKind,
        shard_count: usize,
        replication: usize,
        port: u16,
    ) -> Result<CollectionInfo> {
        if shard_count == 0 {
            return Err(CacheError::Config("a collection needs at least one shard".into()));
        }
        if replication == 0 {
            return Err(CacheError::Config("replication must be at least 1".into()));
        }
        if name.is_empty() || name.contains('/') || name.ends_with(".lock") {
            return Err(CacheError::Config(format!("invalid collection name {:?}", name)));
        }

        self.ensure_root().await?;
        self.acquire_lock(name).await?;
        let result = self.create_locked(name, kind, shard_count, replication, port).await;
        self.release_lock(name).await;

        if result.is_ok() {
            info!(
                "Created {} collection {} with {} shards, replication {}",
                kind, name, shard_count, replication
            );
        }
        result
    }

    async fn create_locked(
        &self,
        name: &str,
        kind: CollectionKind,
        shard_count: usize,
        replication: usize,
        port: u16,
    ) -> Result<CollectionInfo> {
        let info = CollectionInfo::new(name, kind, shard_count, replication, port);
        self.coordinator
            .create(&self.path(name), info.to_bytes()?, NodeMode::Persistent)
            .await?;
        self.coordinator
            .create(&shards_path(&self.root, name), Vec::new(), NodeMode::Persistent)
            .await?;
        Ok(info)
    }

    /// Removes the collection and every shard status node under it.
    pub async fn destroy(&self, name: &str) -> Result<()> {
        self.acquire_lock(name).await?;
        let result = self.destroy_locked(name).await;
        self.release_lock(name).await;

        if result.is_ok() {
            info!("Destroyed collection {}", name);
        }
        result
    }

    async fn destroy_locked(&self, name: &str) -> Result<()> {
        let shards = shards_path(&self.root, name);
        match self.coordinator.children(&shards).await {
            Ok(children) => {
                for child in children {
                    match self.coordinator.delete(&format!("{}/{}", shards, child)).await {
                        Ok(()) | Err(CoordinationError::NoNode(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                self.coordinator.delete(&shards).await?;
            }
            Err(CoordinationError::NoNode(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.coordinator
            .delete(&self.path(name))
            .await
            .map_err(|e| self.not_found(name, e))
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.coordinator.exists(&self.path(name)).await?)
    }

    pub async fn info(&self, name: &str) -> Result<CollectionInfo> {
        let (data, _) = self
            .coordinator
            .get(&self.path(name))
            .await
            .map_err(|e| self.not_found(name, e))?;
        Ok(CollectionInfo::from_bytes(&data)?)
    }

    /// Collection names under the root.
    pub async fn list(&self) -> Result<Vec<String>> {
        match self.coordinator.children(&self.root).await {
            Ok(children) => Ok(children
                .into_iter()
                .filter(|child| !child.ends_with(".lock"))
                .collect()),
            Err(CoordinationError::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies `mutate` to the stored metadata under the collection lock. The
    /// node is only rewritten when the metadata actually changed.
    pub async fn update<T, F>(&self, name: &str, mutate: F) -> Result<(CollectionInfo, T)>
    where
        F: FnOnce(&mut CollectionInfo) -> T + Send,
        T: Send,
    {
        self.acquire_lock(name).await?;
        let result = self.update_locked(name, mutate).await;
        self.release_lock(name).await;
        result
    }

    async fn update_locked<T, F>(&self, name: &str, mutate: F) -> Result<(CollectionInfo, T)>
    where
        F: FnOnce(&mut CollectionInfo) -> T + Send,
        T: Send,
    {
        let path = self.path(name);
        let (data, version) = self
            .coordinator
            .get(&path)
            .await
            .map_err(|e| self.not_found(name, e))?;
        let before = CollectionInfo::from_bytes(&data)?;

        let mut after = before.clone();
        let output = mutate(&mut after);
        if after != before {
            self.coordinator
                .set_data(&path, after.to_bytes()?, Some(version))
                .await?;
        }
        Ok((after, output))
    }

    /// Returns whether the bit changed.
    pub async fn set_shard_availability(&self, name: &str, shard: ShardIndex, up: bool) -> Result<bool> {
        let (_, changed) = self
            .update(name, |info| info.availability.set(shard, up))
            .await?;
        if changed {
            debug!("Shard {} of {} marked {}", shard, name, if up { "up" } else { "down" });
        }
        Ok(changed)
    }

    /// Publishes a new bulk-load source with the next generation number.
    pub async fn set_source(
        &self,
        name: &str,
        path: &str,
        approx_records: u64,
        false_positive_rate: f64,
    ) -> Result<SourceDescriptor> {
        let (_, source) = self
            .update(name, |info| {
                let generation = info.source.as_ref().map_or(1, |s| s.generation + 1);
                let source = SourceDescriptor {
                    path: path.to_string(),
                    approx_records,
                    false_positive_rate,
                    generation,
                };
                info.source = Some(source.clone());
                source
            })
            .await?;
        info!(
            "Collection {} will load {} (generation {})",
            name, source.path, source.generation
        );
        Ok(source)
    }

    pub fn shard_path(&self, name: &str, shard: ShardIndex) -> String {
        shard_path(&self.root, name, shard)
    }
}
