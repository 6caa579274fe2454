//! Shared state of the directory daemon

use haybale_common::config::DirectoryConfig;
use haybale_common::ops_window::OpsWindow;
use haybale_common::types::now_ms;
use haybale_common::{Error, PhotoRecord, Result, StoreDescriptor, StoreId, StoreStatus};
use haybale_meta_store::MetaStore;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Replica role in the election state machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// Not the leader; the hint is the last observed holder
    Follower { leader: Option<String> },
    /// Lease key observed absent; about to attempt acquisition
    Candidate,
    /// Holding the lease
    Leader,
}

/// Shared state behind every handler and background task
pub struct DirectoryState {
    /// Daemon configuration
    pub config: DirectoryConfig,
    /// Address this replica advertises (also the lease value when leading)
    pub advertise_addr: String,
    /// Persistent photo records
    pub meta: MetaStore,
    /// Store descriptors learned from heartbeats
    pub stores: RwLock<HashMap<StoreId, StoreDescriptor>>,
    /// Election role
    pub role: RwLock<Role>,
    /// Per-photo read counters feeding the hotness signal
    pub reads: Mutex<HashMap<u64, Arc<OpsWindow>>>,
    /// Committed deltas queued for push to followers
    pub push_tx: mpsc::UnboundedSender<Vec<PhotoRecord>>,
    /// Follower anti-entropy watermark (leader clock of the last pull)
    pub sync_watermark: AtomicU64,
}

impl DirectoryState {
    /// Whether this replica currently acts as leader
    #[must_use]
    pub fn is_leader(&self) -> bool {
        *self.role.read() == Role::Leader
    }

    /// Guard for leader-only operations
    pub fn require_leader(&self) -> Result<()> {
        match &*self.role.read() {
            Role::Leader => Ok(()),
            Role::Follower { leader } => Err(Error::NotLeader {
                leader: leader.clone(),
            }),
            Role::Candidate => Err(Error::NotLeader { leader: None }),
        }
    }

    /// Record a read of a photo for hotness tracking
    pub fn record_read(&self, photo_id: u64) {
        self.reads
            .lock()
            .entry(photo_id)
            .or_insert_with(|| Arc::new(OpsWindow::new()))
            .record();
    }

    /// The photo's 60 s read count
    #[must_use]
    pub fn read_rate(&self, photo_id: u64) -> u64 {
        self.reads
            .lock()
            .get(&photo_id)
            .map(|w| w.count())
            .unwrap_or(0)
    }

    /// Drop read windows that have gone idle
    pub fn prune_read_windows(&self) {
        self.reads.lock().retain(|_, w| w.count() > 0);
    }

    /// Snapshot of all descriptors
    #[must_use]
    pub fn store_snapshot(&self) -> Vec<StoreDescriptor> {
        self.stores.read().values().cloned().collect()
    }

    /// Ids of stores that are placement and read targets right now
    #[must_use]
    pub fn healthy_store_ids(&self) -> BTreeSet<StoreId> {
        let now = now_ms();
        let window = self.config.health_window_secs * 1000;
        self.stores
            .read()
            .values()
            .filter(|d| d.is_healthy(now, window))
            .map(|d| d.store_id)
            .collect()
    }

    /// Descriptors that are placement and read targets right now
    #[must_use]
    pub fn healthy_stores(&self) -> Vec<StoreDescriptor> {
        let now = now_ms();
        let window = self.config.health_window_secs * 1000;
        self.stores
            .read()
            .values()
            .filter(|d| d.is_healthy(now, window))
            .cloned()
            .collect()
    }

    /// Absorb a heartbeat: reset the silence clock and refresh stats
    pub fn absorb_heartbeat(&self, mut descriptor: StoreDescriptor) {
        descriptor.last_heartbeat_ms = now_ms();
        descriptor.status = StoreStatus::Healthy;
        self.stores
            .write()
            .insert(descriptor.store_id, descriptor);
    }

    /// Queue a committed delta for follower push
    pub fn push_delta(&self, records: Vec<PhotoRecord>) {
        if !records.is_empty() {
            // Receiver lives for the process lifetime; a send failure only
            // happens during shutdown
            let _ = self.push_tx.send(records);
        }
    }
}
