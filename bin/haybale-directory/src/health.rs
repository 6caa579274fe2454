//! Store health scanner
//!
//! Walks the descriptor table and advances silence-driven transitions:
//! Healthy -> Suspect past half the health window, Suspect -> Down past the
//! full window. Down stores drop out of placement and locate results; a
//! fresh heartbeat restores Healthy immediately.

use crate::state::DirectoryState;
use haybale_common::types::now_ms;
use haybale_common::StoreStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Run the scanner until shutdown
pub async fn health_scan_loop(state: Arc<DirectoryState>, mut shutdown: watch::Receiver<bool>) {
    let window_ms = state.config.health_window_secs * 1000;
    let interval = Duration::from_secs((state.config.health_window_secs / 4).max(1));

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                info!("health scanner stopping");
                return;
            }
        }

        scan_once(&state, window_ms);
        state.prune_read_windows();
    }
}

/// One pass over the descriptor table
pub fn scan_once(state: &DirectoryState, window_ms: u64) {
    let now = now_ms();
    let mut stores = state.stores.write();
    for descriptor in stores.values_mut() {
        let silence = now.saturating_sub(descriptor.last_heartbeat_ms);
        let next = if silence > window_ms {
            StoreStatus::Down
        } else if silence > window_ms / 2 {
            StoreStatus::Suspect
        } else {
            StoreStatus::Healthy
        };
        if next != descriptor.status {
            warn!(
                store = %descriptor.store_id,
                from = %descriptor.status,
                to = %next,
                silence_ms = silence,
                "store health transition"
            );
            descriptor.status = next;
        }
    }
}
