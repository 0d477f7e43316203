use anyhow::Context;
use clap::{Parser, Subcommand};
use shardset::client::CacheClient;
use shardset::config::Config;
use shardset::coordination::{CollectionAdmin, CollectionKind, Coordinator, MemoryCoordinator, SafetyNet};
use shardset::routing::ShardRouter;
use shardset::server::http::{router, StatusContext};
use shardset::server::{ShardState, ShardWorker};
use shardset::storage::FileSource;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "shardset", about = "Replicated shard set/map cache")]
struct Args {
    /// JSON configuration file. SHARDSET_* variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Runs every shard of one collection in this process.
    Cluster(ClusterArgs),
}

#[derive(Parser, Debug)]
struct ClusterArgs {
    #[arg(long, default_value = "default")]
    name: String,

    /// static-set, dynamic-set, map-set or triple-set.
    #[arg(long, default_value = "dynamic-set")]
    kind: CollectionKind,

    #[arg(long, default_value_t = 4)]
    shards: usize,

    #[arg(long, default_value_t = 2)]
    replication: usize,

    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Shard i listens on base_port + i.
    #[arg(long, default_value_t = 7000)]
    base_port: u16,

    /// Status endpoint port, base_port + 1000 when omitted.
    #[arg(long)]
    status_port: Option<u16>,

    /// Line-oriented file to bulk-load into a static set.
    #[arg(long)]
    load: Option<PathBuf>,

    #[arg(long, default_value_t = 100_000)]
    approx_records: u64,

    #[arg(long, default_value_t = 0.01)]
    false_positive_rate: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    match args.cmd {
        Cmd::Cluster(cluster) => run_cluster(config, cluster).await,
    }
}

async fn run_cluster(mut config: Config, args: ClusterArgs) -> anyhow::Result<()> {
    let zk = MemoryCoordinator::new();
    let admin = CollectionAdmin::new(Arc::new(zk.clone()), config.root.clone());

    // 1. Collection metadata:
    let info = admin
        .create(&args.name, args.kind, args.shards, args.replication, args.base_port)
        .await?;
    tracing::info!(
        "Collection {} ({}) with {} shards, replication {}",
        info.name,
        info.kind,
        info.shard_count,
        info.replication
    );

    // 2. Shard workers, each with its own coordination session:
    let mut handles = Vec::with_capacity(info.shard_count);
    let mut servers = Vec::with_capacity(info.shard_count);
    let mut addresses = Vec::with_capacity(info.shard_count);
    for shard in 0..info.shard_count {
        let port = args
            .base_port
            .checked_add(shard as u16)
            .context("shard port out of range")?;
        let addr = SocketAddr::new(args.bind, port);
        let state = Arc::new(ShardState::new(
            &info,
            shard,
            ShardRouter::from_kind(config.hash),
            Arc::new(FileSource),
            Some(CollectionAdmin::new(Arc::new(zk.session()), config.root.clone())),
        ));
        let worker = ShardWorker::bind(addr, state)
            .await
            .with_context(|| format!("binding shard {} to {}", shard, addr))?
            .with_heartbeat(config.heartbeat_interval());

        handles.push(worker.shutdown_handle());
        addresses.push(addr.to_string());
        servers.push(tokio::spawn(worker.serve()));
    }

    // 3. Safety net:
    let safety_net = Arc::new(SafetyNet::new(
        admin.clone(),
        config.safety_net_timeout(),
        config.safety_net_interval(),
    ));
    let sweeper = safety_net.spawn();

    // 4. Optional bulk load through a regular client:
    if let Some(path) = &args.load {
        config.shard_addresses = addresses;
        let coordinator: Arc<dyn Coordinator> = Arc::new(zk.session());
        let mut client = CacheClient::connect(&config, coordinator, &args.name).await?;
        let descriptor = client
            .load(&path.to_string_lossy(), args.approx_records, args.false_positive_rate)
            .await?;
        tracing::info!(
            "Loaded {} as generation {}, {} records across replicas",
            descriptor.path,
            descriptor.generation,
            client.size().await?
        );
    }

    // 5. Status endpoint:
    let status_port = args.status_port.unwrap_or(args.base_port.saturating_add(1000));
    let status_addr = SocketAddr::new(args.bind, status_port);
    let app = router(StatusContext {
        admin: admin.clone(),
        collection: args.name.clone(),
    });
    let listener = tokio::net::TcpListener::bind(status_addr).await?;

    tracing::info!("Status endpoint on http://{}/status", status_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("Shutting down {} shards", handles.len());
    sweeper.abort();
    for handle in &handles {
        handle.trigger();
    }
    for server in servers {
        if let Err(e) = server.await? {
            tracing::warn!("Shard stopped with error: {}", e);
        }
    }
    Ok(())
}
