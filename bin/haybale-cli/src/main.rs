//! Haybale client CLI
//!
//! `upload <path>` prints the assigned id; `download <id> <path>` fetches
//! through the cache with replica failover; `status <id>` and `stats` show
//! metadata and cluster state. Exit code 0 on success, nonzero on failure
//! with diagnostics on stderr.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use haybale_client::{DirectoryClient, StoreClient};
use haybale_common::{checksum, PhotoId, StoreId};
use haybale_coord::{BlobCache, RedisBackend};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "haybale")]
#[command(about = "Haybale blob store client")]
#[command(version)]
struct Args {
    /// Directory addresses (repeatable)
    #[arg(short, long, default_value = "http://127.0.0.1:7200")]
    directory: Vec<String>,

    /// Redis URL for the blob cache; cache is skipped when unreachable
    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Cache entry TTL in seconds
    #[arg(long, default_value_t = 86400)]
    cache_ttl_secs: u64,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a file and print its id
    Upload {
        /// File to upload
        path: PathBuf,
    },
    /// Download a blob to a file
    Download {
        /// Blob id
        id: PhotoId,
        /// Destination file
        path: PathBuf,
    },
    /// Delete a blob
    Delete {
        /// Blob id
        id: PhotoId,
    },
    /// Show a blob's metadata
    Status {
        /// Blob id
        id: PhotoId,
    },
    /// Show cluster store statistics
    Stats,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(err) = run(args).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let directory = DirectoryClient::new(args.directory.clone())?;
    let cache = connect_cache(&args.redis_url, args.cache_ttl_secs).await;

    match args.command {
        Commands::Upload { path } => upload(&directory, path).await,
        Commands::Download { id, path } => download(&directory, cache.as_deref(), id, path).await,
        Commands::Delete { id } => delete(&directory, cache.as_deref(), id).await,
        Commands::Status { id } => status(&directory, id).await,
        Commands::Stats => stats(&directory).await,
    }
}

/// The cache is an optimization; a missing Redis only costs performance
async fn connect_cache(url: &str, ttl_secs: u64) -> Option<Box<BlobCache>> {
    match RedisBackend::connect(url).await {
        Ok(backend) => Some(Box::new(BlobCache::new(
            Arc::new(backend),
            Duration::from_secs(ttl_secs),
        ))),
        Err(err) => {
            warn!(%err, "cache unavailable; reads go to the stores");
            None
        }
    }
}

async fn upload(directory: &DirectoryClient, path: PathBuf) -> Result<()> {
    let bytes = Bytes::from(
        std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?,
    );
    let digest = checksum::sha256_hex(&bytes);

    let registered = directory.register(bytes.len() as u64, &digest).await?;
    if registered.locations.is_empty() {
        bail!("directory returned no stores");
    }

    let mut written: Vec<StoreId> = Vec::new();
    for location in &registered.locations {
        let store = StoreClient::new(&location.address)?;
        match store.put(registered.photo_id, bytes.clone(), &digest).await {
            Ok(()) => written.push(location.store_id),
            Err(err) => {
                eprintln!("warning: write to {} failed: {err}", location.address);
            }
        }
    }
    if written.is_empty() {
        bail!("no store accepted the upload");
    }

    directory.commit(registered.photo_id, written).await?;
    println!("{}", registered.photo_id);
    Ok(())
}

async fn download(
    directory: &DirectoryClient,
    cache: Option<&BlobCache>,
    id: PhotoId,
    path: PathBuf,
) -> Result<()> {
    if let Some(cache) = cache {
        if let Some(bytes) = cache.get(id).await {
            std::fs::write(&path, &bytes)
                .with_context(|| format!("writing {}", path.display()))?;
            return Ok(());
        }
    }

    let status = directory.status(id).await?;
    if status.healthy_locations.is_empty() {
        bail!("no healthy replica of {id} is currently reachable");
    }

    let mut last_err = None;
    for location in &status.healthy_locations {
        let store = StoreClient::new(&location.address)?;
        match store.get(id).await {
            Ok(bytes) => {
                let digest = checksum::sha256_hex(&bytes);
                if digest != status.record.checksum {
                    eprintln!(
                        "warning: checksum mismatch from {}; trying next replica",
                        location.address
                    );
                    continue;
                }
                std::fs::write(&path, &bytes)
                    .with_context(|| format!("writing {}", path.display()))?;
                if let Some(cache) = cache {
                    cache.put(id, &bytes).await;
                }
                return Ok(());
            }
            Err(err) => {
                eprintln!("warning: read from {} failed: {err}", location.address);
                last_err = Some(err);
            }
        }
    }
    bail!(
        "every replica failed; last error: {}",
        last_err.map_or_else(|| "none".to_string(), |e| e.to_string())
    )
}

async fn delete(directory: &DirectoryClient, cache: Option<&BlobCache>, id: PhotoId) -> Result<()> {
    // Locations before the tombstone, so the replicas can be drained now
    // rather than waiting for their GC cycles
    let locations = directory
        .status(id)
        .await
        .map(|s| s.healthy_locations)
        .unwrap_or_default();

    directory.mark_deleted(id).await?;
    for location in locations {
        let store = StoreClient::new(&location.address)?;
        if let Err(err) = store.delete(id).await {
            if !err.is_not_found() {
                eprintln!("warning: delete on {} failed: {err}", location.address);
            }
        }
    }
    if let Some(cache) = cache {
        cache.invalidate(id).await;
    }
    println!("deleted {id}");
    Ok(())
}

async fn status(directory: &DirectoryClient, id: PhotoId) -> Result<()> {
    let status = directory.status(id).await?;
    let record = &status.record;
    println!("photo:     {}", record.photo_id);
    println!("size:      {} bytes", record.size);
    println!("checksum:  {}", record.checksum);
    println!("deleted:   {}", record.deleted);
    println!(
        "replicas:  {} healthy / {} recorded / {} desired",
        status.healthy_locations.len(),
        record.locations.len(),
        record.desired_replicas
    );
    for location in &status.healthy_locations {
        println!("  {} {}", location.store_id, location.address);
    }
    Ok(())
}

async fn stats(directory: &DirectoryClient) -> Result<()> {
    let mut stores = directory.stores().await?;
    stores.sort_by_key(|d| d.store_id);
    println!(
        "{:<38} {:<10} {:>12} {:>12} {:>12} {:>8}",
        "store", "status", "free", "volume", "live", "ops/60s"
    );
    for store in stores {
        println!(
            "{:<38} {:<10} {:>12} {:>12} {:>12} {:>8}",
            store.store_id.to_string(),
            store.status.to_string(),
            store.free_bytes,
            store.volume_bytes,
            store.live_bytes,
            store.ops_60s
        );
    }
    Ok(())
}
