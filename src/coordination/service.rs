use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("node {0} does not exist")]
    NoNode(String),

    #[error("node {0} already exists")]
    NodeExists(String),

    #[error("node {path} is at version {actual}, expected {expected}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("node {0} has children")]
    NotEmpty(String),

    #[error("coordination session is closed")]
    SessionClosed,

    #[error("cannot decode node data: {0}")]
    Decode(String),
}

/// Lifetime of a node. Ephemeral nodes disappear with the session that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    Persistent,
    Ephemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    DataChanged,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

/// A one-shot watch. It fires at most once; callers re-arm by reading again.
#[derive(Debug)]
pub struct Watch {
    rx: oneshot::Receiver<WatchEvent>,
}

impl Watch {
    pub(crate) fn new(rx: oneshot::Receiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Waits for the watched node to change. `None` means the session went
    /// away before anything happened.
    pub async fn fired(self) -> Option<WatchEvent> {
        self.rx.await.ok()
    }
}

/// Contract of the hierarchical coordination service (ZooKeeper-like).
///
/// Paths are `/`-separated. A node can only be created under an existing parent.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn create(&self, path: &str, data: Vec<u8>, mode: NodeMode) -> Result<(), CoordinationError>;

    /// Returns the node data and its version.
    async fn get(&self, path: &str) -> Result<(Vec<u8>, u64), CoordinationError>;

    async fn get_and_watch(&self, path: &str) -> Result<(Vec<u8>, u64, Watch), CoordinationError>;

    /// Replaces the data. With `expected_version` the write only succeeds if the
    /// node is still at that version. Returns the new version.
    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<u64, CoordinationError>;

    async fn delete(&self, path: &str) -> Result<(), CoordinationError>;

    async fn exists(&self, path: &str) -> Result<bool, CoordinationError>;

    /// Like `exists`, but also arms a watch that fires on creation, change or deletion.
    async fn exists_and_watch(&self, path: &str) -> Result<(bool, Watch), CoordinationError>;

    /// Names (not full paths) of the direct children, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError>;
}
