use super::connection::ShardClient;
use crate::availability::AvailabilityTracker;
use crate::config::Config;
use crate::coordination::{
    CollectionAdmin, CollectionInfo, CollectionKind, CoordinationError, Coordinator, ShardStatus, SourceDescriptor,
};
use crate::error::{CacheError, Result};
use crate::filter::MembershipFilter;
use crate::protocol::{Command, Request};
use crate::routing::{ShardIndex, ShardRouter};
use crate::storage::{Triple, TriplePrefix};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const LOAD_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What a membership-filter miss means for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegativePolicy {
    /// A filter miss on the first live replica answers `false` at once.
    #[default]
    Authoritative,
    /// A filter miss moves on to the next replica.
    ConsultReplicas,
}

impl FromStr for NegativePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "authoritative" => Ok(NegativePolicy::Authoritative),
            "consult_replicas" => Ok(NegativePolicy::ConsultReplicas),
            other => Err(format!("unknown negative policy: {}", other)),
        }
    }
}

/// One shard-level call.
#[derive(Debug, Clone, Copy)]
enum Op<'a> {
    Contains(&'a str),
    ContainsEntry(&'a str, &'a str),
    Get(&'a str),
    Add(&'a str),
    AddEntry(&'a str, &'a str),
    /// A set record, or a whole key on a map-set.
    Remove(&'a str),
    RemoveEntry(&'a str, &'a str),
    ContainsTriple(&'a Triple),
    AddTriple(&'a Triple),
    RemoveTriple(&'a Triple),
    RetainAll(&'a [String]),
    IsEmpty,
    Size,
    Clear,
}

impl<'a> Op<'a> {
    /// The routing key; empty for collection-wide operations.
    fn key(&self) -> Cow<'a, str> {
        match *self {
            Op::Contains(key)
            | Op::ContainsEntry(key, _)
            | Op::Get(key)
            | Op::Add(key)
            | Op::AddEntry(key, _)
            | Op::Remove(key)
            | Op::RemoveEntry(key, _) => Cow::Borrowed(key),
            Op::ContainsTriple(triple) | Op::AddTriple(triple) | Op::RemoveTriple(triple) => {
                Cow::Owned(triple.key())
            }
            Op::RetainAll(_) | Op::IsEmpty | Op::Size | Op::Clear => Cow::Borrowed(""),
        }
    }

    /// The item a membership filter can rule out.
    fn filter_item(&self) -> Option<&'a str> {
        match *self {
            Op::Contains(key) => Some(key),
            _ => None,
        }
    }

    fn negative(&self) -> Answer {
        match self {
            Op::Get(_) => Answer::Values(Vec::new()),
            Op::Size => Answer::Count(0),
            Op::Clear => Answer::Done,
            _ => Answer::Bool(false),
        }
    }
}

/// One record of a batch write: where it routes and what goes on the wire.
struct BatchItem {
    key: String,
    fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Answer {
    Bool(bool),
    Count(u64),
    Values(Vec<String>),
    Done,
}

impl Answer {
    fn is_true(&self) -> bool {
        matches!(self, Answer::Bool(true))
    }

    fn count(&self) -> u64 {
        match self {
            Answer::Count(count) => *count,
            _ => 0,
        }
    }

    fn into_values(self) -> Vec<String> {
        match self {
            Answer::Values(values) => values,
            _ => Vec::new(),
        }
    }
}

/// Client handle on one collection.
///
/// Routes each key to its replica set, skips shards known to be down, consults
/// the shard's membership filter before paying for a round trip and falls back
/// across replicas until one answers. Holds one connection per shard; calls
/// are sequential, so operations take `&mut self`.
pub struct CacheClient {
    info: CollectionInfo,
    admin: CollectionAdmin,
    router: ShardRouter,
    tracker: Arc<AvailabilityTracker>,
    shards: Vec<ShardClient>,
    filters: Vec<Option<MembershipFilter>>,
    negative_policy: NegativePolicy,
    load_timeout: Duration,
    /// Addresses come from shard status nodes and are re-read on reconnect.
    discovered: bool,
    watcher: JoinHandle<()>,
}

impl CacheClient {
    /// Opens every shard connection of collection `name`.
    ///
    /// A shard that cannot be reached is marked down instead of failing the
    /// whole client.
    pub async fn connect(config: &Config, coordinator: Arc<dyn Coordinator>, name: &str) -> Result<Self> {
        let admin = CollectionAdmin::new(coordinator.clone(), config.root.clone());
        let info = admin.info(name).await?;

        let discovered = config.shard_addresses.is_empty();
        let addresses = if discovered {
            let mut addresses = Vec::with_capacity(info.shard_count);
            for shard in 0..info.shard_count {
                addresses.push(read_address(&admin, name, shard).await.unwrap_or_default());
            }
            addresses
        } else if config.shard_addresses.len() != info.shard_count {
            return Err(CacheError::Config(format!(
                "{} shard addresses configured, collection {} has {} shards",
                config.shard_addresses.len(),
                name,
                info.shard_count
            )));
        } else {
            config.shard_addresses.clone()
        };

        let tracker = Arc::new(AvailabilityTracker::new(&info.availability));
        let watcher = tracker.watch(coordinator, admin.path(name));

        let policy = config.retry_policy();
        let mut shards = Vec::with_capacity(info.shard_count);
        for (shard, address) in addresses.into_iter().enumerate() {
            let mut client = ShardClient::new(shard, address, policy.clone());
            if !tracker.is_up(shard) {
                debug!("Shard {} of {} is down, not connecting", shard, name);
            } else if client.address().is_empty() {
                warn!("Shard {} of {} has no known address", shard, name);
                tracker.mark_down(shard);
            } else if let Err(e) = client.connect().await {
                warn!("Shard {} of {} unreachable: {}", shard, name, e);
                tracker.mark_down(shard);
            }
            shards.push(client);
        }

        let mut client = Self {
            filters: vec![None; info.shard_count],
            info,
            admin,
            router: ShardRouter::from_kind(config.hash),
            tracker,
            shards,
            negative_policy: config.negative_policy,
            load_timeout: config.load_timeout(),
            discovered,
            watcher,
        };
        client.refresh_filters().await;

        info!(
            "Connected to {} ({}, {} shards, replication {}): {} up",
            client.info.name,
            client.info.kind,
            client.info.shard_count,
            client.info.replication,
            client.tracker.up_count()
        );
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn kind(&self) -> CollectionKind {
        self.info.kind
    }

    pub fn info(&self) -> &CollectionInfo {
        &self.info
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn tracker(&self) -> &Arc<AvailabilityTracker> {
        &self.tracker
    }

    /// Replica set of `key`, primary first.
    pub fn replicas(&self, key: &str) -> Vec<ShardIndex> {
        self.router
            .route(key, self.info.shard_count, self.info.replication)
    }

    pub fn has_filter(&self, shard: ShardIndex) -> bool {
        self.filters.get(shard).is_some_and(Option::is_some)
    }

    pub fn is_connected(&self, shard: ShardIndex) -> bool {
        self.shards.get(shard).is_some_and(ShardClient::is_connected)
    }

    fn budget(&self) -> usize {
        self.info.effective_replication()
    }

    /// Applies a pending availability snapshot and closes links to shards it
    /// reports down. Every operation does this first.
    pub fn refresh_availability(&mut self) -> Result<()> {
        for shard in self.tracker.refresh_if_notified() {
            self.shards[shard].disconnect();
        }
        if self.tracker.is_removed() {
            return Err(CacheError::CollectionNotFound(self.info.name.clone()));
        }
        Ok(())
    }

    fn require_map(&self) -> Result<()> {
        if !self.info.kind.is_map() {
            return Err(CacheError::UnsupportedKind(self.info.kind.to_string()));
        }
        Ok(())
    }

    fn require_set(&self) -> Result<()> {
        if !self.info.kind.is_plain_set() {
            return Err(CacheError::UnsupportedKind(self.info.kind.to_string()));
        }
        Ok(())
    }

    fn require_triple(&self) -> Result<()> {
        if !self.info.kind.is_triple() {
            return Err(CacheError::UnsupportedKind(self.info.kind.to_string()));
        }
        Ok(())
    }

    /// Single-string keys: plain sets and map-sets.
    fn require_keyed(&self) -> Result<()> {
        if self.info.kind.is_triple() {
            return Err(CacheError::UnsupportedKind(self.info.kind.to_string()));
        }
        Ok(())
    }

    fn require_writable(&self) -> Result<()> {
        if self.info.kind.is_read_only() {
            return Err(CacheError::ReadOnly(self.info.name.clone()));
        }
        Ok(())
    }

    // --- Shard calls ---

    fn filter_rejects(&self, shard: ShardIndex, item: Option<&str>) -> bool {
        match (item, &self.filters[shard]) {
            (Some(item), Some(filter)) => !filter.test(item),
            _ => false,
        }
    }

    async fn refresh_filter(&mut self, shard: ShardIndex) {
        if !self.info.kind.has_filter() {
            return;
        }
        let downloaded = match self.shards[shard].filter().await {
            Ok(Some(bytes)) => MembershipFilter::from_bytes(&bytes)
                .map(Some)
                .map_err(CacheError::from),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        match downloaded {
            Ok(filter) => self.filters[shard] = filter,
            Err(e) => {
                warn!("Filter of shard {} unavailable: {}", shard, e);
                self.filters[shard] = None;
                if e.is_connection_fatal() {
                    self.tracker.mark_down(shard);
                }
            }
        }
    }

    /// Makes one reconnect attempt if the link is closed. Returns whether it
    /// reconnected.
    async fn ensure_connected(&mut self, shard: ShardIndex) -> Result<bool> {
        if self.shards[shard].is_connected() {
            return Ok(false);
        }
        if self.discovered {
            if let Some(address) = read_address(&self.admin, &self.info.name, shard).await {
                self.shards[shard].set_address(address);
            }
        }

        info!("Shard {} not connected, attempting reconnect", shard);
        match self.shards[shard].reconnect().await {
            Ok(()) => {
                self.tracker.mark_up(shard);
                self.refresh_filter(shard).await;
                Ok(true)
            }
            Err(e) => {
                self.tracker.mark_down(shard);
                Err(e)
            }
        }
    }

    async fn query(&mut self, shard: ShardIndex, op: Op<'_>) -> Result<Answer> {
        let client = &mut self.shards[shard];
        let answer = match op {
            Op::Contains(key) => Answer::Bool(client.contains(key).await?),
            Op::ContainsEntry(key, value) => Answer::Bool(client.contains_entry(key, value).await?),
            Op::Get(key) => Answer::Values(client.get(key).await?),
            Op::Add(record) => Answer::Bool(client.add(record).await?),
            Op::AddEntry(key, value) => Answer::Bool(client.add_entry(key, value).await?),
            Op::Remove(record) => Answer::Bool(client.remove(record).await?),
            Op::RemoveEntry(key, value) => Answer::Bool(client.remove_entry(key, value).await?),
            Op::ContainsTriple(triple) => Answer::Bool(client.contains_triple(triple).await?),
            Op::AddTriple(triple) => Answer::Bool(client.add_triple(triple).await?),
            Op::RemoveTriple(triple) => Answer::Bool(client.remove_triple(triple).await?),
            Op::RetainAll(records) => Answer::Bool(client.retain_all(records).await?),
            Op::IsEmpty => Answer::Bool(client.is_empty().await?),
            Op::Size => Answer::Count(client.size().await?),
            Op::Clear => {
                client.clear().await?;
                Answer::Done
            }
        };
        Ok(answer)
    }

    /// Asks one live shard. `Ok(None)` means its membership filter ruled the
    /// item out without a round trip.
    async fn call_shard(&mut self, shard: ShardIndex, op: Op<'_>) -> Result<Option<Answer>> {
        if self.filter_rejects(shard, op.filter_item()) {
            return Ok(None);
        }
        if self.ensure_connected(shard).await? && self.filter_rejects(shard, op.filter_item()) {
            return Ok(None);
        }
        match self.query(shard, op).await {
            Err(e) => {
                if e.is_connection_fatal() {
                    self.tracker.mark_down(shard);
                }
                Err(e)
            }
            answer => answer.map(Some),
        }
    }

    /// Runs a keyed operation against the key's replicas in order and returns
    /// the first answer.
    async fn route_key(&mut self, op: Op<'_>) -> Result<Answer> {
        self.refresh_availability()?;
        let key = op.key();
        let replicas = self.replicas(&key);
        let mut failed = 0;

        for &shard in &replicas {
            if !self.tracker.is_up(shard) {
                failed += 1;
                continue;
            }
            match self.call_shard(shard, op).await {
                Ok(Some(answer)) => return Ok(answer),
                Ok(None) => {
                    if self.negative_policy == NegativePolicy::Authoritative {
                        return Ok(op.negative());
                    }
                }
                Err(e @ CacheError::Server { .. }) => return Err(e),
                Err(e) => {
                    warn!("Replica {} failed for {:?}: {}", shard, key, e);
                    failed += 1;
                }
            }
        }

        if failed >= replicas.len() {
            return Err(CacheError::Unavailable { key: key.into_owned() });
        }
        Ok(op.negative())
    }

    /// Runs `op` on every live shard. Returns the answers and the number of
    /// shards that could not be asked. `stop` ends the sweep early.
    async fn sweep<F>(&mut self, op: Op<'_>, stop: F) -> Result<(Vec<Answer>, usize)>
    where
        F: Fn(&Answer) -> bool,
    {
        self.refresh_availability()?;
        let mut answers = Vec::with_capacity(self.info.shard_count);
        let mut unreachable = 0;

        for shard in 0..self.info.shard_count {
            if !self.tracker.is_up(shard) {
                unreachable += 1;
                continue;
            }
            match self.call_shard(shard, op).await {
                Ok(Some(answer)) => {
                    let done = stop(&answer);
                    answers.push(answer);
                    if done {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e @ CacheError::Server { .. }) => return Err(e),
                Err(e) => {
                    warn!("Shard {} failed during {:?}: {}", shard, op, e);
                    unreachable += 1;
                }
            }
        }
        Ok((answers, unreachable))
    }

    /// Writes each item to the first live replica of its key, one `AddAll`
    /// per shard. A shard that fails is marked down and its items are routed
    /// again. Items already written stay written if a later one is unavailable.
    async fn add_batch(&mut self, items: Vec<BatchItem>) -> Result<u64> {
        self.refresh_availability()?;
        let mut pending = items;
        let mut added = 0;

        while !pending.is_empty() {
            let mut batches: BTreeMap<ShardIndex, Vec<BatchItem>> = BTreeMap::new();
            for item in pending.drain(..) {
                let target = self
                    .replicas(&item.key)
                    .into_iter()
                    .find(|&shard| self.tracker.is_up(shard));
                match target {
                    Some(shard) => batches.entry(shard).or_default().push(item),
                    None => return Err(CacheError::Unavailable { key: item.key }),
                }
            }

            for (shard, batch) in batches {
                let fields: Vec<String> = batch
                    .iter()
                    .flat_map(|item| item.fields.iter().cloned())
                    .collect();
                match self.add_all_on(shard, &fields).await {
                    Ok(count) => added += count,
                    Err(e @ CacheError::Server { .. }) => return Err(e),
                    Err(e) => {
                        warn!("Batch of {} failed on shard {}: {}", batch.len(), shard, e);
                        self.tracker.mark_down(shard);
                        pending.extend(batch);
                    }
                }
            }
        }
        Ok(added)
    }

    async fn add_all_on(&mut self, shard: ShardIndex, fields: &[String]) -> Result<u64> {
        self.ensure_connected(shard).await?;
        match self.shards[shard].add_all(fields).await {
            Err(e) => {
                if e.is_connection_fatal() {
                    self.tracker.mark_down(shard);
                }
                Err(e)
            }
            added => added,
        }
    }

    fn collection_unavailable(&self, unreachable: usize) -> CacheError {
        CacheError::CollectionUnavailable {
            collection: self.info.name.clone(),
            unreachable,
        }
    }

    // --- Set operations ---

    /// Whether `record` is in the set, or for a map-set whether `record` is a key.
    pub async fn contains(&mut self, record: &str) -> Result<bool> {
        self.require_keyed()?;
        Ok(self.route_key(Op::Contains(record)).await?.is_true())
    }

    /// True when every record is present. Stops at the first miss.
    pub async fn contains_all<S: AsRef<str>>(&mut self, records: &[S]) -> Result<bool> {
        for record in records {
            if !self.contains(record.as_ref()).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Adds every record, one request per target shard. Returns how many
    /// were newly added.
    pub async fn add_all<S: AsRef<str>>(&mut self, records: &[S]) -> Result<u64> {
        self.require_set()?;
        self.require_writable()?;
        let items = records
            .iter()
            .map(|record| BatchItem {
                key: record.as_ref().to_string(),
                fields: vec![record.as_ref().to_string()],
            })
            .collect();
        self.add_batch(items).await
    }

    /// Keeps only the given records on every shard. Returns whether anything
    /// was dropped.
    pub async fn retain_all<S: AsRef<str>>(&mut self, records: &[S]) -> Result<bool> {
        self.require_set()?;
        self.require_writable()?;
        let keep: Vec<String> = records.iter().map(|r| r.as_ref().to_string()).collect();
        let (answers, unreachable) = self.sweep(Op::RetainAll(&keep), |_| false).await?;
        if unreachable > 0 {
            return Err(self.collection_unavailable(unreachable));
        }
        Ok(answers.iter().any(Answer::is_true))
    }

    /// Returns true when the record was newly added.
    pub async fn add(&mut self, record: &str) -> Result<bool> {
        self.require_set()?;
        self.require_writable()?;
        Ok(self.route_key(Op::Add(record)).await?.is_true())
    }

    pub async fn remove(&mut self, record: &str) -> Result<bool> {
        self.require_set()?;
        self.require_writable()?;
        Ok(self.route_key(Op::Remove(record)).await?.is_true())
    }

    // --- Map-set operations ---

    pub async fn contains_key(&mut self, key: &str) -> Result<bool> {
        self.require_map()?;
        Ok(self.route_key(Op::Contains(key)).await?.is_true())
    }

    pub async fn contains_entry(&mut self, key: &str, value: &str) -> Result<bool> {
        self.require_map()?;
        Ok(self
            .route_key(Op::ContainsEntry(key, value))
            .await?
            .is_true())
    }

    /// Values stored under `key`, empty when the key is absent.
    pub async fn get(&mut self, key: &str) -> Result<Vec<String>> {
        self.require_map()?;
        Ok(self.route_key(Op::Get(key)).await?.into_values())
    }

    pub async fn add_entry(&mut self, key: &str, value: &str) -> Result<bool> {
        self.require_map()?;
        Ok(self.route_key(Op::AddEntry(key, value)).await?.is_true())
    }

    /// Adds `(key, value)` pairs, one request per target shard.
    pub async fn add_all_entries<K: AsRef<str>, V: AsRef<str>>(&mut self, entries: &[(K, V)]) -> Result<u64> {
        self.require_map()?;
        let items = entries
            .iter()
            .map(|(key, value)| BatchItem {
                key: key.as_ref().to_string(),
                fields: vec![key.as_ref().to_string(), value.as_ref().to_string()],
            })
            .collect();
        self.add_batch(items).await
    }

    pub async fn remove_key(&mut self, key: &str) -> Result<bool> {
        self.require_map()?;
        Ok(self.route_key(Op::Remove(key)).await?.is_true())
    }

    pub async fn remove_entry(&mut self, key: &str, value: &str) -> Result<bool> {
        self.require_map()?;
        Ok(self
            .route_key(Op::RemoveEntry(key, value))
            .await?
            .is_true())
    }

    // --- Triple-set operations ---

    pub async fn contains_triple(&mut self, triple: &Triple) -> Result<bool> {
        self.require_triple()?;
        Ok(self.route_key(Op::ContainsTriple(triple)).await?.is_true())
    }

    pub async fn contains_all_triples(&mut self, triples: &[Triple]) -> Result<bool> {
        for triple in triples {
            if !self.contains_triple(triple).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn add_triple(&mut self, triple: &Triple) -> Result<bool> {
        self.require_triple()?;
        Ok(self.route_key(Op::AddTriple(triple)).await?.is_true())
    }

    pub async fn add_all_triples(&mut self, triples: &[Triple]) -> Result<u64> {
        self.require_triple()?;
        let items = triples
            .iter()
            .map(|triple| BatchItem {
                key: triple.key(),
                fields: triple.fields(),
            })
            .collect();
        self.add_batch(items).await
    }

    pub async fn remove_triple(&mut self, triple: &Triple) -> Result<bool> {
        self.require_triple()?;
        Ok(self.route_key(Op::RemoveTriple(triple)).await?.is_true())
    }

    /// Triples matching `prefix` from every reachable shard. Triples are routed
    /// by all three fields, so every shard is asked. Records are
    /// `[first, second, third]`, once per replica.
    pub async fn scan_triples(&mut self, prefix: TriplePrefix<'_>) -> Result<CollectionScan<'_>> {
        self.require_triple()?;
        self.start_scan(false, Request::new(Command::Scan, prefix.fields()))
    }

    /// Like `scan_triples`, but yields each distinct triple once.
    pub async fn scan_triples_distinct(&mut self, prefix: TriplePrefix<'_>) -> Result<CollectionScan<'_>> {
        self.require_triple()?;
        self.start_scan(true, Request::new(Command::Scan, prefix.fields()))
    }

    // --- Collection-wide operations ---

    /// False as soon as one live shard holds data.
    pub async fn is_empty(&mut self) -> Result<bool> {
        let (answers, unreachable) = self.sweep(Op::IsEmpty, |a| !a.is_true()).await?;
        if answers.iter().any(|a| !a.is_true()) {
            return Ok(false);
        }
        if unreachable >= self.budget() {
            return Err(self.collection_unavailable(unreachable));
        }
        Ok(true)
    }

    /// Sum of per-shard record counts, replicas included. Map-sets count keys.
    pub async fn size(&mut self) -> Result<u64> {
        let (answers, unreachable) = self.sweep(Op::Size, |_| false).await?;
        if unreachable > 0 {
            return Err(self.collection_unavailable(unreachable));
        }
        Ok(answers.iter().map(Answer::count).sum())
    }

    /// Empties every shard.
    pub async fn clear(&mut self) -> Result<()> {
        self.require_writable()?;
        let (_, unreachable) = self.sweep(Op::Clear, |_| false).await?;
        if unreachable > 0 {
            return Err(self.collection_unavailable(unreachable));
        }
        Ok(())
    }

    /// Streams every record of every reachable shard. Replicated records
    /// appear once per replica.
    pub async fn scan(&mut self) -> Result<CollectionScan<'_>> {
        self.start_scan(false, Request::bare(Command::Scan))
    }

    /// Like `scan`, but yields each distinct record once.
    pub async fn scan_distinct(&mut self) -> Result<CollectionScan<'_>> {
        self.start_scan(true, Request::bare(Command::Scan))
    }

    fn start_scan(&mut self, distinct: bool, request: Request) -> Result<CollectionScan<'_>> {
        self.refresh_availability()?;
        let shards: Vec<ShardIndex> = (0..self.info.shard_count)
            .filter(|&shard| self.tracker.is_up(shard))
            .collect();
        let unreachable = self.info.shard_count - shards.len();
        let budget = self.budget();
        if unreachable >= budget {
            return Err(self.collection_unavailable(unreachable));
        }

        Ok(CollectionScan {
            client: self,
            request,
            shards,
            position: 0,
            remaining: 0,
            in_stream: false,
            unreachable,
            budget,
            seen: distinct.then(HashSet::new),
        })
    }

    /// Sends a scan request to a live shard and returns its record count.
    async fn open_scan(&mut self, shard: ShardIndex, request: &Request) -> Result<u32> {
        self.ensure_connected(shard).await?;
        match self.shards[shard].begin_stream(request.clone()).await {
            Err(e) => {
                if e.is_connection_fatal() {
                    self.tracker.mark_down(shard);
                }
                Err(e)
            }
            count => count,
        }
    }

    // --- Bulk load ---

    /// Publishes a new source for a static collection and waits until enough
    /// shards have reloaded it to answer every key, then downloads fresh filters.
    pub async fn load(&mut self, path: &str, approx_records: u64, false_positive_rate: f64) -> Result<SourceDescriptor> {
        if self.info.kind != CollectionKind::StaticSet {
            return Err(CacheError::UnsupportedKind(self.info.kind.to_string()));
        }
        MembershipFilter::with_rate(approx_records.max(1), false_positive_rate)?;

        let descriptor = self
            .admin
            .set_source(&self.info.name, path, approx_records, false_positive_rate)
            .await?;
        self.await_generation(descriptor.generation).await?;
        self.info.source = Some(descriptor.clone());

        let filters = self.refresh_filters().await;
        info!(
            "Collection {} loaded generation {} ({} shard filters)",
            self.info.name, descriptor.generation, filters
        );
        Ok(descriptor)
    }

    /// Shards that are up and report at least `generation`.
    async fn reloaded_shards(&self, info: &CollectionInfo, generation: u64) -> usize {
        let mut ready = 0;
        for shard in 0..info.shard_count {
            if !info.availability.is_up(shard) {
                continue;
            }
            let path = self.admin.shard_path(&info.name, shard);
            if let Ok((data, _)) = self.admin.coordinator().get(&path).await {
                if ShardStatus::from_bytes(&data).is_ok_and(|s| s.generation >= generation && !s.loading) {
                    ready += 1;
                }
            }
        }
        ready
    }

    async fn await_generation(&mut self, generation: u64) -> Result<()> {
        let path = self.admin.path(&self.info.name);
        let quorum = self.info.load_quorum();
        let deadline = Instant::now() + self.load_timeout;

        loop {
            let (data, _, watch) = match self.admin.coordinator().get_and_watch(&path).await {
                Ok(found) => found,
                Err(CoordinationError::NoNode(_)) => {
                    return Err(CacheError::CollectionNotFound(self.info.name.clone()));
                }
                Err(e) => return Err(e.into()),
            };
            let info = CollectionInfo::from_bytes(&data)?;
            let ready = self.reloaded_shards(&info, generation).await;
            if ready >= quorum {
                debug!("{} of {} shards at generation {}", ready, info.shard_count, generation);
                self.tracker.publish(info.availability);
                self.refresh_availability()?;
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CacheError::LoadFailed(format!(
                    "{} of {} required shards reloaded generation {} within {:?}",
                    ready, quorum, generation, self.load_timeout
                )));
            }
            let wait = (deadline - now).min(LOAD_POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, watch.fired()).await;
        }
    }

    /// Re-downloads the membership filter of every live shard. Returns how
    /// many shards now have one.
    pub async fn refresh_filters(&mut self) -> usize {
        if !self.info.kind.has_filter() {
            return 0;
        }
        for shard in 0..self.info.shard_count {
            if !self.tracker.is_up(shard) {
                self.filters[shard] = None;
                continue;
            }
            match self.ensure_connected(shard).await {
                Ok(true) => {}
                Ok(false) => self.refresh_filter(shard).await,
                Err(e) => debug!("Shard {} skipped for filter refresh: {}", shard, e),
            }
        }
        self.filters.iter().filter(|f| f.is_some()).count()
    }

    /// Closes every shard connection. The client reconnects on demand.
    pub fn disconnect(&mut self) {
        for client in &mut self.shards {
            client.disconnect();
        }
    }
}

impl Drop for CacheClient {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn read_address(admin: &CollectionAdmin, name: &str, shard: ShardIndex) -> Option<String> {
    let (data, _) = admin.coordinator().get(&admin.shard_path(name, shard)).await.ok()?;
    ShardStatus::from_bytes(&data).ok().map(|status| status.address)
}

/// Lazy walk over the records of every reachable shard, one shard at a time.
///
/// Losing a shard mid-scan counts against the replication budget; once as
/// many shards as there are replicas are lost the scan fails. Dropping the
/// scan mid-stream closes that shard's connection.
pub struct CollectionScan<'a> {
    client: &'a mut CacheClient,
    request: Request,
    shards: Vec<ShardIndex>,
    position: usize,
    remaining: u32,
    in_stream: bool,
    unreachable: usize,
    budget: usize,
    seen: Option<HashSet<Vec<String>>>,
}

impl CollectionScan<'_> {
    pub fn unreachable(&self) -> usize {
        self.unreachable
    }

    fn lose(&mut self, shard: ShardIndex, error: CacheError) -> Result<()> {
        if let CacheError::Server { .. } = error {
            return Err(error);
        }
        warn!("Shard {} lost during scan: {}", shard, error);
        self.client.tracker.mark_down(shard);
        self.unreachable += 1;
        if self.unreachable >= self.budget {
            return Err(self.client.collection_unavailable(self.unreachable));
        }
        Ok(())
    }

    /// The next record, or `None` once every shard is exhausted.
    pub async fn next(&mut self) -> Result<Option<Vec<String>>> {
        loop {
            if self.in_stream {
                let shard = self.shards[self.position];
                if self.remaining == 0 {
                    self.in_stream = false;
                    self.position += 1;
                    if let Err(e) = self.client.shards[shard].finish_stream().await {
                        self.lose(shard, e)?;
                    }
                    continue;
                }
                match self.client.shards[shard].next_record().await {
                    Ok(record) => {
                        self.remaining -= 1;
                        if let Some(seen) = &mut self.seen {
                            if !seen.insert(record.clone()) {
                                continue;
                            }
                        }
                        return Ok(Some(record));
                    }
                    Err(e) => {
                        self.in_stream = false;
                        self.position += 1;
                        self.lose(shard, e)?;
                        continue;
                    }
                }
            }

            let Some(&shard) = self.shards.get(self.position) else {
                return Ok(None);
            };
            match self.client.open_scan(shard, &self.request).await {
                Ok(count) => {
                    self.in_stream = true;
                    self.remaining = count;
                }
                Err(e) => {
                    self.position += 1;
                    self.lose(shard, e)?;
                }
            }
        }
    }

    pub async fn collect(mut self) -> Result<Vec<Vec<String>>> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await? {
            records.push(record);
        }
        Ok(records)
    }
}

impl Drop for CollectionScan<'_> {
    fn drop(&mut self) {
        if self.in_stream {
            if let Some(&shard) = self.shards.get(self.position) {
                self.client.shards[shard].disconnect();
            }
        }
    }
}
