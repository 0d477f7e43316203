use super::service::{
    CoordinationError, Coordinator, NodeMode, Watch, WatchEvent, WatchEventKind,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

#[derive(Debug)]
struct ZNode {
    data: Vec<u8>,
    version: u64,
    owner: Option<Uuid>,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, ZNode>,
    watches: HashMap<String, Vec<(Uuid, oneshot::Sender<WatchEvent>)>>,
    closed: HashSet<Uuid>,
}

impl Tree {
    fn fire(&mut self, path: &str, kind: WatchEventKind) {
        if let Some(waiters) = self.watches.remove(path) {
            for (_, tx) in waiters {
                let _ = tx.send(WatchEvent {
                    path: path.to_string(),
                    kind,
                });
            }
        }
    }

    fn arm(&mut self, path: &str, session: Uuid) -> Watch {
        let (tx, rx) = oneshot::channel();
        self.watches
            .entry(path.to_string())
            .or_default()
            .push((session, tx));
        Watch::new(rx)
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        self.nodes
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(child, _)| child.starts_with(&prefix))
    }
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

/// In-process coordination service.
///
/// Every clone shares the same tree and session. `session()` hands out a new
/// independent session over the same tree, the way separate processes would
/// each hold their own connection to the real service.
#[derive(Debug, Clone)]
pub struct MemoryCoordinator {
    tree: Arc<Mutex<Tree>>,
    session: Uuid,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::default())),
            session: Uuid::new_v4(),
        }
    }

    pub fn session(&self) -> Self {
        Self {
            tree: self.tree.clone(),
            session: Uuid::new_v4(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session
    }

    /// Ends the session: its ephemeral nodes are removed (firing their watches)
    /// and its pending watches are dropped.
    pub async fn close(&self) {
        let mut tree = self.tree.lock().await;
        if !tree.closed.insert(self.session) {
            return;
        }

        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(self.session))
            .map(|(path, _)| path.clone())
            .collect();

        for path in owned {
            tree.nodes.remove(&path);
            tree.fire(&path, WatchEventKind::Deleted);
        }

        let session = self.session;
        for waiters in tree.watches.values_mut() {
            waiters.retain(|(owner, _)| *owner != session);
        }
        tree.watches.retain(|_, waiters| !waiters.is_empty());

        tracing::debug!("Coordination session {} closed", session);
    }

    async fn open_tree(&self) -> Result<tokio::sync::MutexGuard<'_, Tree>, CoordinationError> {
        let tree = self.tree.lock().await;
        if tree.closed.contains(&self.session) {
            return Err(CoordinationError::SessionClosed);
        }
        Ok(tree)
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn create(&self, path: &str, data: Vec<u8>, mode: NodeMode) -> Result<(), CoordinationError> {
        let mut tree = self.open_tree().await?;

        if tree.nodes.contains_key(path) {
            return Err(CoordinationError::NodeExists(path.to_string()));
        }
        if let Some(parent) = parent_of(path) {
            if !tree.nodes.contains_key(parent) {
                return Err(CoordinationError::NoNode(parent.to_string()));
            }
        }

        let owner = match mode {
            NodeMode::Persistent => None,
            NodeMode::Ephemeral => Some(self.session),
        };
        tree.nodes.insert(
            path.to_string(),
            ZNode {
                data,
                version: 0,
                owner,
            },
        );
        tree.fire(path, WatchEventKind::Created);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<(Vec<u8>, u64), CoordinationError> {
        let tree = self.open_tree().await?;
        tree.nodes
            .get(path)
            .map(|node| (node.data.clone(), node.version))
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))
    }

    async fn get_and_watch(&self, path: &str) -> Result<(Vec<u8>, u64, Watch), CoordinationError> {
        let mut tree = self.open_tree().await?;
        let (data, version) = tree
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), node.version))
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        let watch = tree.arm(path, self.session);
        Ok((data, version, watch))
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<u64, CoordinationError> {
        let mut tree = self.open_tree().await?;
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;

        if let Some(expected) = expected_version {
            if node.version != expected {
                return Err(CoordinationError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }

        node.data = data;
        node.version += 1;
        let version = node.version;
        tree.fire(path, WatchEventKind::DataChanged);
        Ok(version)
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        let mut tree = self.open_tree().await?;
        if !tree.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        if tree.has_children(path) {
            return Err(CoordinationError::NotEmpty(path.to_string()));
        }
        tree.nodes.remove(path);
        tree.fire(path, WatchEventKind::Deleted);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordinationError> {
        let tree = self.open_tree().await?;
        Ok(tree.nodes.contains_key(path))
    }

    async fn exists_and_watch(&self, path: &str) -> Result<(bool, Watch), CoordinationError> {
        let mut tree = self.open_tree().await?;
        let exists = tree.nodes.contains_key(path);
        let watch = tree.arm(path, self.session);
        Ok((exists, watch))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        let tree = self.open_tree().await?;
        if !tree.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }

        let prefix = format!("{}/", path);
        let children = tree
            .nodes
            .range(prefix.clone()..)
            .take_while(|(child, _)| child.starts_with(&prefix))
            .filter_map(|(child, _)| {
                let rest = &child[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        Ok(children)
    }
}
