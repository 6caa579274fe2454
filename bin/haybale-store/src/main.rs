//! Haybale store daemon
//!
//! Serves the blob read/write HTTP interface over an append-only volume
//! directory, heartbeats to the directories, and runs the compaction and
//! GC workers.

mod rate_limit;
mod service;
mod workers;

use anyhow::{Context, Result};
use clap::Parser;
use haybale_client::DirectoryClient;
use haybale_common::config::StoreConfig;
use haybale_common::ops_window::OpsWindow;
use haybale_common::StoreId;
use haybale_coord::{BlobCache, RedisBackend};
use haybale_volume::{EngineConfig, StoreEngine};
use rate_limit::RateLimiter;
use service::StoreState;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "haybale-store")]
#[command(about = "Haybale blob store daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/haybale/store.toml")]
    config: String,

    /// Listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Advertise address (how other services reach this store)
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Data directory for volume files
    #[arg(long)]
    data_dir: Option<String>,

    /// Directory addresses (repeatable)
    #[arg(long)]
    directory: Vec<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config: StoreConfig = if Path::new(&args.config).exists() {
        let raw = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", args.config))?
    } else {
        StoreConfig::default()
    };

    // CLI flags take precedence over the config file
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(addr) = args.advertise_addr {
        config.advertise_addr = Some(addr);
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir.into();
    }
    if !args.directory.is_empty() {
        config.directories = args.directory;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.directories.is_empty() {
        anyhow::bail!("no directory addresses configured; use --directory or the config file");
    }

    let advertise_addr = advertise_address(&config);
    let store_id = load_or_create_store_id(&config.data_dir)?;
    info!(%store_id, listen = %config.listen, advertise = %advertise_addr, "starting haybale store");

    let engine = StoreEngine::open(EngineConfig {
        data_dir: config.data_dir.clone(),
        max_volume_size: config.max_volume_size,
        capacity_bytes: config.capacity_bytes,
        free_bytes_floor: config.free_bytes_floor,
        compaction_efficiency_threshold: config.compaction_efficiency_threshold,
    })?;

    let backend = RedisBackend::connect(&config.coord.redis_url)
        .await
        .with_context(|| format!("connecting to redis at {}", config.coord.redis_url))?;
    let cache = BlobCache::new(
        Arc::new(backend),
        Duration::from_secs(config.coord.cache_ttl_secs),
    );

    let state = Arc::new(StoreState {
        store_id,
        advertise_addr,
        engine: Arc::new(engine),
        cache: Arc::new(cache),
        ops: Arc::new(OpsWindow::new()),
        limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
    });

    let directory = DirectoryClient::new(config.directories.clone())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(workers::heartbeat_loop(
        Arc::clone(&state),
        directory.clone(),
        config.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(workers::compaction_loop(
        Arc::clone(&state),
        config.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(workers::gc_loop(
        Arc::clone(&state),
        directory,
        config.clone(),
        shutdown_rx,
    ));

    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen))?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "store listening");

    let app = service::router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down");
    })
    .await?;

    let _ = shutdown_tx.send(true);
    info!("store shut down gracefully");
    Ok(())
}

/// The address other services use to reach this store
fn advertise_address(config: &StoreConfig) -> String {
    if let Some(addr) = &config.advertise_addr {
        if addr.starts_with("http://") || addr.starts_with("https://") {
            return addr.clone();
        }
        return format!("http://{addr}");
    }
    if let Some(port) = config.listen.rsplit(':').next() {
        if config.listen.starts_with("0.0.0.0") {
            return format!("http://127.0.0.1:{port}");
        }
    }
    format!("http://{}", config.listen)
}

/// Stable store identity, persisted next to the volumes
fn load_or_create_store_id(data_dir: &Path) -> Result<StoreId> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join("store_id");
    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        return raw
            .trim()
            .parse()
            .with_context(|| format!("corrupt store id file {}", path.display()));
    }
    let id = StoreId::new();
    std::fs::write(&path, format!("{id}\n"))?;
    Ok(id)
}
