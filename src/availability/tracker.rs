use crate::coordination::{
    AvailabilityBitmap, CollectionInfo, CoordinationError, Coordinator, WatchEventKind,
};
use crate::routing::ShardIndex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const WATCH_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Up,
    /// Marked down by this client; the coordination service still says up.
    Suspect,
    /// Down according to the coordination service.
    Down,
}

/// Per-shard availability as seen by one client.
///
/// Holds two bits per shard: the local optimistic bit, flipped immediately on
/// I/O failures and reconnects, and the last authoritative bit from the
/// coordination service. Authoritative snapshots are delivered in the background
/// and only take effect when the owner calls `refresh_if_notified`.
#[derive(Debug)]
pub struct AvailabilityTracker {
    local: Vec<AtomicBool>,
    authoritative: Vec<AtomicBool>,
    pending: Mutex<Option<AvailabilityBitmap>>,
    removed: AtomicBool,
}

impl AvailabilityTracker {
    pub fn new(initial: &AvailabilityBitmap) -> Self {
        let bits = |bitmap: &AvailabilityBitmap| {
            (0..bitmap.len())
                .map(|shard| AtomicBool::new(bitmap.is_up(shard)))
                .collect::<Vec<_>>()
        };
        Self {
            local: bits(initial),
            authoritative: bits(initial),
            pending: Mutex::new(None),
            removed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// Out-of-range shards are never up.
    pub fn is_up(&self, shard: ShardIndex) -> bool {
        self.local
            .get(shard)
            .is_some_and(|bit| bit.load(Ordering::Acquire))
    }

    pub fn mark_down(&self, shard: ShardIndex) {
        if let Some(bit) = self.local.get(shard) {
            if bit.swap(false, Ordering::AcqRel) {
                debug!("Shard {} marked down locally", shard);
            }
        }
    }

    pub fn mark_up(&self, shard: ShardIndex) {
        if let Some(bit) = self.local.get(shard) {
            if !bit.swap(true, Ordering::AcqRel) {
                debug!("Shard {} marked up locally", shard);
            }
        }
    }

    pub fn state(&self, shard: ShardIndex) -> ShardState {
        let authoritative = self
            .authoritative
            .get(shard)
            .is_some_and(|bit| bit.load(Ordering::Acquire));
        match (self.is_up(shard), authoritative) {
            (true, _) => ShardState::Up,
            (false, true) => ShardState::Suspect,
            (false, false) => ShardState::Down,
        }
    }

    pub fn up_count(&self) -> usize {
        (0..self.len()).filter(|&shard| self.is_up(shard)).count()
    }

    /// Local bits as a bitmap.
    pub fn snapshot(&self) -> AvailabilityBitmap {
        let mut bitmap = AvailabilityBitmap::all_down(self.len());
        for shard in 0..self.len() {
            bitmap.set(shard, self.is_up(shard));
        }
        bitmap
    }

    /// True once the collection node has been deleted.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<AvailabilityBitmap>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn has_pending(&self) -> bool {
        self.lock_pending().is_some()
    }

    /// Stores an authoritative snapshot for the next refresh. A newer snapshot
    /// replaces an unapplied older one.
    pub fn publish(&self, bitmap: AvailabilityBitmap) {
        if bitmap.len() != self.len() {
            warn!(
                "Ignoring availability snapshot for {} shards, tracking {}",
                bitmap.len(),
                self.len()
            );
            return;
        }
        *self.lock_pending() = Some(bitmap);
    }

    /// Applies a pending snapshot, if any. Authoritative bits overwrite local
    /// bits. Returns every shard that is down in the snapshot so the caller can
    /// close its connection.
    pub fn refresh_if_notified(&self) -> Vec<ShardIndex> {
        let Some(bitmap) = self.lock_pending().take() else {
            return Vec::new();
        };

        let mut down = Vec::new();
        for shard in 0..self.len() {
            let up = bitmap.is_up(shard);
            self.authoritative[shard].store(up, Ordering::Release);
            self.local[shard].store(up, Ordering::Release);
            if !up {
                down.push(shard);
            }
        }
        debug!(
            "Applied availability snapshot: {}/{} shards up",
            self.len() - down.len(),
            self.len()
        );
        down
    }

    fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
        self.publish(AvailabilityBitmap::all_down(self.len()));
    }

    /// Spawns the background task that keeps a one-shot watch armed on the
    /// collection node and publishes every new bitmap it reads.
    pub fn watch(self: &Arc<Self>, coordinator: Arc<dyn Coordinator>, path: String) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let watch = match coordinator.get_and_watch(&path).await {
                    Ok((data, _, watch)) => {
                        match CollectionInfo::from_bytes(&data) {
                            Ok(info) => tracker.publish(info.availability),
                            Err(e) => warn!("Unreadable metadata at {}: {}", path, e),
                        }
                        watch
                    }
                    Err(CoordinationError::NoNode(_)) => {
                        info!("Collection node {} removed, all shards down", path);
                        tracker.mark_removed();
                        return;
                    }
                    Err(CoordinationError::SessionClosed) => return,
                    Err(e) => {
                        warn!("Failed to watch {}: {}", path, e);
                        tokio::time::sleep(WATCH_RETRY_DELAY).await;
                        continue;
                    }
                };

                match watch.fired().await {
                    Some(event) if event.kind == WatchEventKind::Deleted => {
                        info!("Collection node {} removed, all shards down", path);
                        tracker.mark_removed();
                        return;
                    }
                    Some(_) => {}
                    None => return,
                }
            }
        })
    }
}
