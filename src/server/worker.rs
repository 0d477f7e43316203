use super::heartbeat::Heartbeat;
use crate::coordination::{
    CollectionAdmin, CollectionInfo, CollectionKind, CoordinationError, ShardStatus,
    SourceDescriptor, WatchEventKind, now_ms,
};
use crate::error::{CacheError, Result};
use crate::protocol::{
    read_request, write_response, write_stream_end, write_stream_header, write_stream_record,
    Command, Request, Response,
};
use crate::routing::{ShardIndex, ShardRouter};
use crate::storage::{
    bulk_load, LocalStore, MapSetStore, RecordSource, SetStore, TriplePrefix, TripleStore,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What the connection loop sends back for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Single(Response),
    /// Records, each a list of fields.
    Stream(Vec<Vec<String>>),
    /// Acknowledge, then stop the shard.
    Shutdown(Response),
}

/// Everything one shard serves: its slice of the collection plus, for static
/// collections, the membership filter over that slice.
pub struct ShardState {
    collection: String,
    kind: CollectionKind,
    shard: ShardIndex,
    shard_count: usize,
    replication: usize,
    store: LocalStore,
    filter: RwLock<Option<Arc<Vec<u8>>>>,
    serving: AtomicBool,
    loaded_generation: AtomicU64,
    initial_source: Option<SourceDescriptor>,
    load_lock: Mutex<()>,
    status_changed: Notify,
    router: ShardRouter,
    source: Arc<dyn RecordSource>,
    admin: Option<CollectionAdmin>,
}

fn argument_error(command: Command, expected: &str, got: usize) -> Reply {
    Reply::Single(Response::error(format!(
        "{} expects {}, got {} arguments",
        command, expected, got
    )))
}

impl ShardState {
    pub fn new(
        info: &CollectionInfo,
        shard: ShardIndex,
        router: ShardRouter,
        source: Arc<dyn RecordSource>,
        admin: Option<CollectionAdmin>,
    ) -> Self {
        let store = match info.kind {
            CollectionKind::MapSet => LocalStore::MapSet(MapSetStore::new()),
            CollectionKind::TripleSet => LocalStore::Triple(TripleStore::new()),
            CollectionKind::StaticSet | CollectionKind::DynamicSet => LocalStore::Set(SetStore::new()),
        };

        Self {
            collection: info.name.clone(),
            kind: info.kind,
            shard,
            shard_count: info.shard_count,
            replication: info.replication,
            store,
            filter: RwLock::new(None),
            serving: AtomicBool::new(false),
            loaded_generation: AtomicU64::new(0),
            initial_source: info.source.clone(),
            load_lock: Mutex::new(()),
            status_changed: Notify::new(),
            router,
            source,
            admin,
        }
    }

    pub fn shard(&self) -> ShardIndex {
        self.shard
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::Acquire)
    }

    pub fn loaded_generation(&self) -> u64 {
        self.loaded_generation.load(Ordering::Acquire)
    }

    pub fn status(&self, address: &str) -> ShardStatus {
        ShardStatus {
            index: self.shard,
            address: address.to_string(),
            size: self.store.len() as u64,
            loading: !self.is_serving(),
            generation: self.loaded_generation(),
            heartbeat_ms: now_ms(),
        }
    }

    async fn publish_availability(&self, up: bool) {
        let Some(admin) = &self.admin else { return };
        if let Err(e) = admin
            .set_shard_availability(&self.collection, self.shard, up)
            .await
        {
            warn!(
                "Shard {} failed to publish availability {}: {}",
                self.shard, up, e
            );
        }
    }

    async fn set_serving(&self, serving: bool) {
        self.serving.store(serving, Ordering::Release);
        self.publish_availability(serving).await;
        self.status_changed.notify_one();
    }

    /// Fires whenever the serving state or loaded generation changes.
    pub fn status_changed(&self) -> &Notify {
        &self.status_changed
    }

    /// Replaces this shard's contents with its share of `descriptor`'s source.
    ///
    /// The shard reports itself down while loading. A failed load leaves it down.
    /// Generations at or below the one already loaded are skipped, except
    /// generation 0 which always reloads.
    pub async fn reload(&self, descriptor: &SourceDescriptor) -> Result<u64> {
        let LocalStore::Set(set) = &self.store else {
            return Err(CacheError::UnsupportedKind(self.kind.to_string()));
        };
        if self.kind != CollectionKind::StaticSet {
            return Err(CacheError::UnsupportedKind(self.kind.to_string()));
        }

        let _guard = self.load_lock.lock().await;
        if descriptor.generation != 0 && descriptor.generation <= self.loaded_generation() {
            debug!(
                "Shard {} already at generation {}",
                self.shard,
                self.loaded_generation()
            );
            return Ok(set.len() as u64);
        }

        info!(
            "Shard {} loading {} (generation {})",
            self.shard, descriptor.path, descriptor.generation
        );
        self.set_serving(false).await;

        let outcome = match bulk_load(
            self.source.as_ref(),
            descriptor,
            &self.router,
            self.shard,
            self.shard_count,
            self.replication,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Shard {} load failed, staying down: {}", self.shard, e);
                return Err(e);
            }
        };

        let filter = outcome.filter.to_bytes()?;
        set.replace_with(outcome.store);
        *self.filter.write().await = Some(Arc::new(filter));
        self.loaded_generation
            .fetch_max(descriptor.generation, Ordering::AcqRel);
        info!(
            "Shard {} holds {} records from generation {}",
            self.shard,
            set.len(),
            descriptor.generation
        );

        self.set_serving(true).await;
        Ok(outcome.added)
    }

    /// Brings the shard online: loads the collection's source if it has one,
    /// otherwise just reports up.
    pub async fn start(&self) {
        match self.initial_source.clone() {
            Some(source) if self.kind == CollectionKind::StaticSet => {
                if let Err(e) = self.reload(&source).await {
                    warn!("Shard {} started without data: {}", self.shard, e);
                }
            }
            _ => self.set_serving(true).await,
        }
    }

    pub async fn stop(&self) {
        self.set_serving(false).await;
    }

    /// Spawns a task that watches the collection node and reloads whenever a
    /// newer source generation is published. Does nothing without an admin.
    pub fn watch_source(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.kind != CollectionKind::StaticSet {
            return None;
        }
        let admin = self.admin.clone()?;
        let state = Arc::clone(self);

        Some(tokio::spawn(async move {
            let path = admin.path(&state.collection);
            loop {
                let (data, _, watch) = match admin.coordinator().get_and_watch(&path).await {
                    Ok(read) => read,
                    Err(CoordinationError::NoNode(_)) | Err(CoordinationError::SessionClosed) => return,
                    Err(e) => {
                        warn!("Shard {} cannot watch {}: {}", state.shard, path, e);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                };

                match CollectionInfo::from_bytes(&data) {
                    Ok(CollectionInfo {
                        source: Some(source),
                        ..
                    }) if source.generation > state.loaded_generation() => {
                        if let Err(e) = state.reload(&source).await {
                            warn!("Shard {} reload failed: {}", state.shard, e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Unreadable metadata at {}: {}", path, e),
                }

                match watch.fired().await {
                    Some(event) if event.kind == WatchEventKind::Deleted => return,
                    Some(_) => {}
                    None => return,
                }
            }
        }))
    }

    /// Answers one request. Never fails: problems become error responses.
    pub async fn dispatch(&self, request: Request) -> Reply {
        let command = match request.command() {
            Ok(command) => command,
            Err(code) => {
                warn!("Shard {} received unknown command {}", self.shard, code);
                return Reply::Single(Response::error(format!("unknown command {}", code)));
            }
        };
        let args = request.args;

        match command {
            Command::Ping => Reply::Single(Response::empty()),
            Command::Kill => {
                info!("Shard {} received kill", self.shard);
                Reply::Shutdown(Response::empty())
            }
            Command::IsEmpty => Reply::Single(Response::from_bool(self.store.is_empty())),
            Command::Size => Reply::Single(Response::from_u64(self.store.len() as u64)),
            Command::Scan => match (&self.store, args.as_slice()) {
                (_, []) => Reply::Stream(self.store.scan()),
                (LocalStore::Triple(triples), prefix) => match TriplePrefix::from_fields(prefix) {
                    Some(prefix) => Reply::Stream(triples.scan(prefix).iter().map(|t| t.fields()).collect()),
                    None => argument_error(command, "at most two prefix fields", args.len()),
                },
                _ => argument_error(command, "no arguments", args.len()),
            },
            Command::Filter => match &*self.filter.read().await {
                Some(bytes) => Reply::Single(Response::ok(vec![bytes.to_vec()])),
                None => Reply::Single(Response::empty()),
            },
            Command::Contains => match (&self.store, args.as_slice()) {
                (LocalStore::Set(set), [record]) => Reply::Single(Response::from_bool(set.contains(record))),
                (LocalStore::MapSet(map), [key]) => Reply::Single(Response::from_bool(map.contains_key(key))),
                (LocalStore::Triple(triples), [first, second, third]) => {
                    Reply::Single(Response::from_bool(triples.contains(first, second, third)))
                }
                (LocalStore::Triple(_), _) => argument_error(command, "three fields", args.len()),
                _ => argument_error(command, "a key", args.len()),
            },
            Command::ContainsEntry => match (&self.store, args.as_slice()) {
                (LocalStore::MapSet(map), [key, value]) => {
                    Reply::Single(Response::from_bool(map.contains_entry(key, value)))
                }
                (LocalStore::MapSet(_), _) => argument_error(command, "a key and a value", args.len()),
                _ => self.unsupported(command),
            },
            Command::Get => match (&self.store, args.as_slice()) {
                (LocalStore::MapSet(map), [key]) => {
                    Reply::Stream(map.get(key).into_iter().map(|v| vec![v]).collect())
                }
                (LocalStore::MapSet(_), _) => argument_error(command, "a key", args.len()),
                _ => self.unsupported(command),
            },
            Command::Add | Command::AddAll | Command::Remove | Command::RetainAll | Command::Clear
                if self.kind.is_read_only() =>
            {
                Reply::Single(Response::error(format!(
                    "{} is read-only, {} rejected",
                    self.collection, command
                )))
            }
            Command::Add => match (&self.store, args.as_slice()) {
                (LocalStore::Set(set), [record]) => Reply::Single(Response::from_bool(set.add(record))),
                (LocalStore::MapSet(map), [key, value]) => {
                    Reply::Single(Response::from_bool(map.add(key, value)))
                }
                (LocalStore::Triple(triples), [first, second, third]) => {
                    Reply::Single(Response::from_bool(triples.add(first, second, third)))
                }
                _ => argument_error(command, "one record, a key and a value, or three fields", args.len()),
            },
            Command::AddAll => match &self.store {
                LocalStore::Set(set) => {
                    Reply::Single(Response::from_u64(set.add_all(args.iter().map(String::as_str))))
                }
                LocalStore::MapSet(map) => {
                    if args.len() % 2 != 0 {
                        return argument_error(command, "key/value pairs", args.len());
                    }
                    let added = args
                        .chunks_exact(2)
                        .filter(|pair| map.add(&pair[0], &pair[1]))
                        .count();
                    Reply::Single(Response::from_u64(added as u64))
                }
                LocalStore::Triple(triples) => {
                    if args.len() % 3 != 0 {
                        return argument_error(command, "whole triples", args.len());
                    }
                    let added = args
                        .chunks_exact(3)
                        .filter(|t| triples.add(&t[0], &t[1], &t[2]))
                        .count();
                    Reply::Single(Response::from_u64(added as u64))
                }
            },
            Command::Remove => match (&self.store, args.as_slice()) {
                (LocalStore::Set(set), [record]) => {
                    Reply::Single(Response::from_bool(set.remove(record)))
                }
                (LocalStore::MapSet(map), [key]) => Reply::Single(Response::from_bool(map.remove_key(key))),
                (LocalStore::MapSet(map), [key, value]) => {
                    Reply::Single(Response::from_bool(map.remove_entry(key, value)))
                }
                (LocalStore::Triple(triples), [first, second, third]) => {
                    Reply::Single(Response::from_bool(triples.remove(first, second, third)))
                }
                _ => argument_error(command, "a record, a key, a key and a value, or three fields", args.len()),
            },
            Command::RetainAll => match &self.store {
                LocalStore::Set(set) => {
                    let keep: HashSet<&str> = args.iter().map(String::as_str).collect();
                    Reply::Single(Response::from_bool(set.retain_all(&keep)))
                }
                _ => self.unsupported(command),
            },
            Command::Clear => {
                self.store.clear();
                Reply::Single(Response::empty())
            }
            Command::Load => self.dispatch_load(&args).await,
        }
    }

    fn unsupported(&self, command: Command) -> Reply {
        Reply::Single(Response::error(format!(
            "{} is not supported by {} collections",
            command, self.kind
        )))
    }

    async fn dispatch_load(&self, args: &[String]) -> Reply {
        if self.kind != CollectionKind::StaticSet {
            return self.unsupported(Command::Load);
        }
        let [path, approx_records, rate] = args else {
            return argument_error(Command::Load, "a path, a record estimate and a rate", args.len());
        };
        let (Ok(approx_records), Ok(false_positive_rate)) =
            (approx_records.parse::<u64>(), rate.parse::<f64>())
        else {
            return Reply::Single(Response::error("malformed load parameters"));
        };

        let descriptor = SourceDescriptor {
            path: path.clone(),
            approx_records,
            false_positive_rate,
            generation: 0,
        };
        match self.reload(&descriptor).await {
            Ok(_) => Reply::Single(Response::from_bool(true)),
            Err(e) => Reply::Single(Response::error(e.to_string())),
        }
    }
}

/// Stops a running worker from outside the connection loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Accepts client connections for one shard and serves each on its own task.
pub struct ShardWorker {
    listener: TcpListener,
    state: Arc<ShardState>,
    shutdown: Arc<watch::Sender<bool>>,
    heartbeat_interval: Option<Duration>,
}

impl ShardWorker {
    pub async fn bind(addr: SocketAddr, state: Arc<ShardState>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (tx, _) = watch::channel(false);
        Ok(Self {
            listener,
            state,
            shutdown: Arc::new(tx),
            heartbeat_interval: None,
        })
    }

    /// Publishes a `ShardStatus` node at this interval while serving.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &Arc<ShardState> {
        &self.state
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown.clone(),
        }
    }

    /// Runs until a Kill request or the shutdown handle stops the shard.
    pub async fn serve(self) -> Result<()> {
        let address = self
            .local_addr()
            .map_err(|e| CacheError::Io {
                shard: self.state.shard,
                source: e,
            })?
            .to_string();

        self.state.start().await;

        let mut background = Vec::new();
        if let Some(watcher) = self.state.watch_source() {
            background.push(watcher);
        }
        let heartbeat = match (self.heartbeat_interval, &self.state.admin) {
            (Some(interval), Some(admin)) => {
                let heartbeat = Heartbeat::new(admin.clone(), self.state.clone(), address.clone(), interval);
                background.push(heartbeat.clone().spawn());
                Some(heartbeat)
            }
            _ => None,
        };

        info!(
            "Shard {} of {} serving on {}",
            self.state.shard, self.state.collection, address
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Shard {} accepted {}", self.state.shard, peer);
                        let state = self.state.clone();
                        let shutdown = self.shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, state, shutdown).await {
                                debug!("Connection from {} closed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("Shard {} accept failed: {}", self.state.shard, e),
                },
                _ = shutdown_rx.wait_for(|stopped| *stopped) => break,
            }
        }

        for task in background {
            task.abort();
        }
        if let Some(heartbeat) = heartbeat {
            heartbeat.remove().await;
        }
        self.state.stop().await;
        info!("Shard {} of {} stopped", self.state.shard, self.state.collection);
        Ok(())
    }
}

/// Record count for a stream header. Streams that do not fit the header
/// become an error reply, which leaves the link in sync.
pub(crate) fn stream_count(len: usize) -> std::result::Result<u32, Response> {
    u32::try_from(len)
        .map_err(|_| Response::error(format!("{} records exceed a single stream", len)))
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<ShardState>,
    shutdown: Arc<watch::Sender<bool>>,
) -> std::result::Result<(), crate::protocol::ProtocolError> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|stopped| *stopped) => return Ok(()),
            request = read_request(&mut reader) => request?,
        };
        let Some(request) = request else {
            return Ok(());
        };

        match state.dispatch(request).await {
            Reply::Single(response) => write_response(&mut writer, &response).await?,
            Reply::Stream(records) => match stream_count(records.len()) {
                Ok(count) => {
                    write_stream_header(&mut writer, count).await?;
                    for record in &records {
                        write_stream_record(&mut writer, record).await?;
                    }
                    write_stream_end(&mut writer).await?;
                }
                Err(response) => {
                    warn!("Shard {} refused an oversized stream: {} records", state.shard, records.len());
                    write_response(&mut writer, &response).await?;
                }
            },
            Reply::Shutdown(response) => {
                write_response(&mut writer, &response).await?;
                shutdown.send_replace(true);
                return Ok(());
            }
        }
    }
}
