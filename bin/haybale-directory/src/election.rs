//! Leader election task
//!
//! Follower -> Candidate when the lease key is absent, Candidate -> Leader
//! on a successful create-if-absent, Leader -> Follower when a refresh
//! fails. The lease value is this replica's advertise address, which is
//! what followers return as the leader hint.

use crate::state::{DirectoryState, Role};
use haybale_coord::LeaderLease;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Upper bound of the pre-acquisition jitter, avoiding thundering herds
const ELECTION_JITTER_MS: u64 = 500;

/// Drive the election state machine until shutdown
pub async fn election_loop(
    state: Arc<DirectoryState>,
    lease: LeaderLease,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let is_leader = state.is_leader();
        let wait = if is_leader {
            lease.refresh_interval()
        } else {
            // Followers re-check at half the TTL so a dead leader is
            // noticed within one lease term
            lease.refresh_interval() + Duration::from_millis(jitter())
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => {
                if state.is_leader() {
                    if let Err(err) = lease.release().await {
                        warn!(%err, "lease release failed on shutdown");
                    }
                }
                info!("election loop stopping");
                return;
            }
        }

        if is_leader {
            match lease.refresh().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("lease lost; demoting to follower");
                    *state.role.write() = Role::Follower { leader: None };
                }
                Err(err) => {
                    // A coordination outage is indistinguishable from a
                    // lost lease; stop accepting leader-only ops
                    warn!(%err, "lease refresh failed; demoting to follower");
                    *state.role.write() = Role::Follower { leader: None };
                }
            }
            continue;
        }

        match lease.current_holder().await {
            Ok(Some(holder)) if holder == lease.id() => {
                // Our lease from a previous run is still alive
                info!("resuming leadership from existing lease");
                *state.role.write() = Role::Leader;
            }
            Ok(Some(holder)) => {
                *state.role.write() = Role::Follower {
                    leader: Some(holder),
                };
            }
            Ok(None) => {
                *state.role.write() = Role::Candidate;
                tokio::time::sleep(Duration::from_millis(jitter())).await;
                match lease.try_acquire().await {
                    Ok(true) => {
                        info!("won leader election");
                        *state.role.write() = Role::Leader;
                    }
                    Ok(false) => {
                        let holder = lease.current_holder().await.ok().flatten();
                        *state.role.write() = Role::Follower { leader: holder };
                    }
                    Err(err) => {
                        warn!(%err, "lease acquisition failed");
                        *state.role.write() = Role::Follower { leader: None };
                    }
                }
            }
            Err(err) => {
                warn!(%err, "cannot read lease key");
                *state.role.write() = Role::Follower { leader: None };
            }
        }
    }
}

fn jitter() -> u64 {
    rand::thread_rng().gen_range(0..ELECTION_JITTER_MS)
}
