//! Background workers of the store daemon
//!
//! Heartbeat, compaction and GC each run as an independent task with a
//! cancellation token. They share state only through the engine and the
//! directory client.

use crate::service::StoreState;
use haybale_client::DirectoryClient;
use haybale_common::config::StoreConfig;
use haybale_common::{StoreDescriptor, StoreStatus};
use haybale_common::types::now_ms;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Push liveness and stats to every directory at the configured interval
pub async fn heartbeat_loop(
    state: Arc<StoreState>,
    directory: DirectoryClient,
    config: StoreConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(config.heartbeat_interval_secs);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                info!("heartbeat loop stopping");
                return;
            }
        }

        let mut stats = state.engine.stats();
        stats.ops_60s = state.ops.count();
        let descriptor = StoreDescriptor {
            store_id: state.store_id,
            address: state.advertise_addr.clone(),
            status: StoreStatus::Healthy,
            last_heartbeat_ms: now_ms(),
            free_bytes: stats.free_bytes,
            volume_bytes: stats.volume_bytes,
            live_bytes: stats.live_bytes,
            ops_60s: stats.ops_60s,
        };

        if let Err(err) = directory.heartbeat(&descriptor).await {
            warn!(%err, "heartbeat delivery failed");
        }
    }
}

/// Compact eligible sealed volumes, one at a time
pub async fn compaction_loop(
    state: Arc<StoreState>,
    config: StoreConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(config.compaction_interval_secs);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                info!("compaction loop stopping");
                return;
            }
        }

        for volume_id in state.engine.compact_eligible() {
            // Compaction runs to completion once started; cancellation is
            // only honored between volumes
            if *shutdown.borrow() {
                return;
            }
            let engine = Arc::clone(&state.engine);
            let result =
                tokio::task::spawn_blocking(move || engine.compact(volume_id)).await;
            match result {
                Ok(Ok(stats)) => debug!(
                    volume = volume_id,
                    kept = stats.needles_kept,
                    reclaimed = stats.bytes_before.saturating_sub(stats.bytes_after),
                    "compaction finished"
                ),
                Ok(Err(err)) => warn!(volume = volume_id, %err, "compaction failed"),
                Err(err) => warn!(volume = volume_id, %err, "compaction task panicked"),
            }
        }
    }
}

/// Tombstone needles the directory no longer knows about
pub async fn gc_loop(
    state: Arc<StoreState>,
    directory: DirectoryClient,
    config: StoreConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(config.gc_interval_secs);
    let grace_ms = config.gc_grace_secs * 1000;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                info!("gc loop stopping");
                return;
            }
        }

        let known: HashSet<u64> = match directory.photos_on_store(state.store_id).await {
            Ok(ids) => ids.into_iter().collect(),
            Err(err) => {
                // Without an authoritative set, deleting anything is unsafe
                warn!(%err, "gc skipped: directory unreachable");
                continue;
            }
        };

        let engine = Arc::clone(&state.engine);
        let removed = tokio::task::spawn_blocking(move || engine.gc(&known, grace_ms)).await;
        match removed {
            Ok(Ok(photos)) => {
                for photo_id in &photos {
                    state.cache.invalidate(*photo_id).await;
                }
                if !photos.is_empty() {
                    info!(count = photos.len(), "gc removed orphaned needles");
                }
            }
            Ok(Err(err)) => warn!(%err, "gc failed"),
            Err(err) => warn!(%err, "gc task panicked"),
        }
    }
}
