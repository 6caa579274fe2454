//! Metadata synchronization
//!
//! The leader pushes every committed delta to each peer with bounded
//! retries; followers additionally poll the leader for changes as an
//! anti-entropy backstop, so follower reads have bounded staleness.

use crate::state::{DirectoryState, Role};
use haybale_client::{retry, DirectoryClient};
use haybale_common::PhotoRecord;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Push committed deltas to every peer until shutdown
pub async fn push_loop(
    state: Arc<DirectoryState>,
    client: DirectoryClient,
    mut deltas: mpsc::UnboundedReceiver<Vec<PhotoRecord>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let records = tokio::select! {
            records = deltas.recv() => match records {
                Some(records) => records,
                None => return,
            },
            _ = shutdown.changed() => {
                info!("push loop stopping");
                return;
            }
        };

        // Only the leader pushes; a demoted replica drains its queue
        if !state.is_leader() {
            continue;
        }

        for peer in &state.config.peers {
            if peer == &state.advertise_addr {
                continue;
            }
            let result = retry::with_backoff("metadata push", retry::DEFAULT_ATTEMPTS, || {
                client.sync_to(peer, records.clone())
            })
            .await;
            match result {
                Ok(()) => debug!(%peer, records = records.len(), "delta pushed"),
                // The follower poll backstop repairs whatever the push missed
                Err(err) => warn!(%peer, %err, "delta push failed; follower poll will catch up"),
            }
        }
    }
}

/// Follower anti-entropy: poll the leader for changes past our watermark
pub async fn follower_sync_loop(
    state: Arc<DirectoryState>,
    client: DirectoryClient,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(state.config.follower_sync_interval_secs);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                info!("follower sync loop stopping");
                return;
            }
        }

        let leader = match &*state.role.read() {
            Role::Leader => continue,
            Role::Follower {
                leader: Some(leader),
            } => leader.clone(),
            _ => continue,
        };
        if leader == state.advertise_addr {
            continue;
        }

        let since = state.sync_watermark.load(Ordering::Acquire);
        match client.changes_from(&leader, since).await {
            Ok(response) => {
                let fetched = response.records.len();
                match state.meta.apply_delta(&response.records) {
                    Ok(applied) => {
                        state
                            .sync_watermark
                            .store(response.now_ms, Ordering::Release);
                        if fetched > 0 {
                            debug!(fetched, applied, "anti-entropy pull applied");
                        }
                    }
                    Err(err) => warn!(%err, "failed to apply anti-entropy delta"),
                }
            }
            Err(err) => warn!(%leader, %err, "anti-entropy pull failed"),
        }
    }
}
