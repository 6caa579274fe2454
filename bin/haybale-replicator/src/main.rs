//! Haybale replication manager
//!
//! Control loop that observes store health and replica counts through the
//! directory, and drives up-replication, de-replication and the nightly
//! full audit. Instances coordinate through an advisory lock so exactly
//! one loop runs cluster-wide.

mod audit;
mod manager;
mod plan;

use anyhow::{Context, Result};
use audit::AuditSchedule;
use clap::Parser;
use haybale_client::DirectoryClient;
use haybale_common::config::ReplicatorConfig;
use haybale_coord::{AdvisoryLock, BlobCache, RedisBackend, REPLICATION_LOCK_KEY};
use manager::ReplicationManager;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "haybale-replicator")]
#[command(about = "Haybale replication manager")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/haybale/replicator.toml")]
    config: String,

    /// Directory addresses (repeatable)
    #[arg(long)]
    directory: Vec<String>,

    /// Run one full audit immediately and exit
    #[arg(long)]
    audit_now: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config: ReplicatorConfig = if Path::new(&args.config).exists() {
        let raw = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", args.config))?
    } else {
        ReplicatorConfig::default()
    };
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

    let backend = Arc::new(
        RedisBackend::connect(&config.coord.redis_url)
            .await
            .with_context(|| format!("connecting to redis at {}", config.coord.redis_url))?,
    );
    let cache = Arc::new(BlobCache::new(
        Arc::clone(&backend) as Arc<dyn haybale_coord::CoordBackend>,
        Duration::from_secs(config.coord.cache_ttl_secs),
    ));

    let directory = DirectoryClient::new(config.directories.clone())?;
    let manager = ReplicationManager::new(directory, cache, config.clone());

    if args.audit_now {
        let summary = manager.audit().await?;
        info!(?summary, "one-shot audit finished");
        return Ok(());
    }

    let holder_id = format!("replicator-{}", uuid::Uuid::new_v4());
    let lock = AdvisoryLock::new(
        backend,
        REPLICATION_LOCK_KEY,
        holder_id,
        Duration::from_secs(config.replock_ttl_secs),
    );

    let mut schedule = AuditSchedule::new(config.nightly_audit_hour);
    let tick = Duration::from_secs(config.tick_interval_secs);
    info!(
        tick_secs = config.tick_interval_secs,
        audit_hour = config.nightly_audit_hour,
        "replication manager running"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                let _ = lock.release().await;
                return Ok(());
            }
        }

        // Exactly one instance runs its loop at a time
        match lock.acquire_or_refresh().await {
            Ok(true) => {}
            Ok(false) => {
                info!("another replicator holds the lock; skipping tick");
                continue;
            }
            Err(err) => {
                warn!(%err, "cannot reach coordination store; skipping tick");
                continue;
            }
        }

        if schedule.due(chrono::Local::now()) {
            match manager.audit().await {
                Ok(summary) => info!(?summary, "nightly audit complete"),
                Err(err) => warn!(%err, "nightly audit failed; retrying next window"),
            }
            continue;
        }

        match manager.tick().await {
            Ok(summary) => {
                if summary.healed + summary.shrunk + summary.adjusted + summary.aborted > 0 {
                    info!(?summary, "replication tick complete");
                }
            }
            Err(err) => warn!(%err, "replication tick failed"),
        }
    }
}
