//! Haybale directory daemon
//!
//! Metadata authority: allocates photo ids, places replicas, answers
//! locate requests filtered by store health, elects one leader per
//! directory cluster through a Redis lease, and keeps followers in sync by
//! push plus an anti-entropy poll.

mod election;
mod health;
mod service;
mod state;
mod sync;

use anyhow::{Context, Result};
use clap::Parser;
use haybale_client::DirectoryClient;
use haybale_common::config::DirectoryConfig;
use haybale_coord::{LeaderLease, RedisBackend, LEADER_KEY};
use haybale_meta_store::MetaStore;
use parking_lot::{Mutex, RwLock};
use state::{DirectoryState, Role};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "haybale-directory")]
#[command(about = "Haybale metadata directory daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/haybale/directory.toml")]
    config: String,

    /// Listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Advertise address (lease value and leader hint)
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Peer directory addresses (repeatable)
    #[arg(long)]
    peer: Vec<String>,

    /// Path of the metadata database
    #[arg(long)]
    meta_path: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config: DirectoryConfig = if Path::new(&args.config).exists() {
        let raw = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", args.config))?
    } else {
        DirectoryConfig::default()
    };

    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(addr) = args.advertise_addr {
        config.advertise_addr = Some(addr);
    }
    if !args.peer.is_empty() {
        config.peers = args.peer;
    }
    if let Some(path) = args.meta_path {
        config.meta_path = path.into();
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let advertise_addr = advertise_address(&config);
    info!(listen = %config.listen, advertise = %advertise_addr, peers = config.peers.len(), "starting haybale directory");

    let meta = MetaStore::open(&config.meta_path)
        .with_context(|| format!("opening {}", config.meta_path.display()))?;

    let backend = Arc::new(
        RedisBackend::connect(&config.coord.redis_url)
            .await
            .with_context(|| format!("connecting to redis at {}", config.coord.redis_url))?,
    );
    let lease = LeaderLease::new(
        backend,
        LEADER_KEY,
        advertise_addr.clone(),
        Duration::from_secs(config.leader_timeout_secs),
    );

    let (push_tx, push_rx) = mpsc::unbounded_channel();
    let state = Arc::new(DirectoryState {
        config: config.clone(),
        advertise_addr: advertise_addr.clone(),
        meta,
        stores: RwLock::new(HashMap::new()),
        role: RwLock::new(Role::Follower { leader: None }),
        reads: Mutex::new(HashMap::new()),
        push_tx,
        sync_watermark: AtomicU64::new(0),
    });

    // Peer-to-peer client used for pushes and anti-entropy pulls
    let peer_client = DirectoryClient::new(if config.peers.is_empty() {
        vec![advertise_addr.clone()]
    } else {
        config.peers.clone()
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(election::election_loop(
        Arc::clone(&state),
        lease,
        shutdown_rx.clone(),
    ));
    tokio::spawn(health::health_scan_loop(
        Arc::clone(&state),
        shutdown_rx.clone(),
    ));
    tokio::spawn(sync::push_loop(
        Arc::clone(&state),
        peer_client.clone(),
        push_rx,
        shutdown_rx.clone(),
    ));
    tokio::spawn(sync::follower_sync_loop(
        Arc::clone(&state),
        peer_client,
        shutdown_rx,
    ));

    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen))?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "directory listening");

    axum::serve(listener, service::router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    info!("directory shut down gracefully");
    Ok(())
}

/// The address peers and clients use for this replica
fn advertise_address(config: &DirectoryConfig) -> String {
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
