//! Replication control loop execution
//!
//! Executes planned actions against the stores and the directory leader.
//! Copies run on a bounded worker pool; an action whose source or
//! destination left the healthy set mid-flight is aborted without touching
//! metadata, and the next tick or the audit retries it.

use crate::plan::{plan_record, PlanContext, PlannedAction};
use futures::stream::{self, StreamExt};
use haybale_client::{DirectoryClient, StoreClient};
use haybale_common::api::ScanMode;
use haybale_common::config::ReplicatorConfig;
use haybale_common::{Error, PhotoId, Result, StoreDescriptor, StoreId};
use haybale_coord::BlobCache;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counters from one tick, for logging and tests
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Records examined
    pub scanned: usize,
    /// Blobs healed (all copies and the commit succeeded)
    pub healed: usize,
    /// Blobs shrunk
    pub shrunk: usize,
    /// Desired-replica adjustments applied
    pub adjusted: usize,
    /// Actions aborted or failed; retried next tick
    pub aborted: usize,
}

/// Replication manager over one directory cluster
pub struct ReplicationManager {
    directory: DirectoryClient,
    cache: Arc<BlobCache>,
    config: ReplicatorConfig,
}

impl ReplicationManager {
    /// Create a manager
    pub fn new(directory: DirectoryClient, cache: Arc<BlobCache>, config: ReplicatorConfig) -> Self {
        Self {
            directory,
            cache,
            config,
        }
    }

    /// Run one control-loop tick over the prioritized slice
    pub async fn tick(&self) -> Result<TickSummary> {
        self.run(ScanMode::Priority).await
    }

    /// Run the full audit over every record
    pub async fn audit(&self) -> Result<TickSummary> {
        info!("starting full replication audit");
        let summary = self.run(ScanMode::Full).await?;
        info!(?summary, "full replication audit finished");
        Ok(summary)
    }

    async fn run(&self, mode: ScanMode) -> Result<TickSummary> {
        let descriptors = self.directory.stores().await?;
        let healthy = healthy_ids(&descriptors);
        let scan = self.directory.scan(mode).await?;

        let mut summary = TickSummary {
            scanned: scan.records.len(),
            ..Default::default()
        };

        let ctx = PlanContext {
            descriptors: &descriptors,
            healthy,
            margin_bytes: self.config.placement_margin_bytes,
            default_replicas: self.config.default_replica_count,
            max_replicas: self.config.max_replica_count,
        };

        let addresses = address_map(&descriptors);
        let mut heals = Vec::new();

        for record in &scan.records {
            for action in plan_record(record, &ctx) {
                match action {
                    PlannedAction::AdjustDesired { photo_id, desired } => {
                        match self.directory.set_desired(photo_id, desired).await {
                            Ok(()) => summary.adjusted += 1,
                            Err(err) => {
                                warn!(photo = %photo_id, %err, "desired adjustment failed");
                                summary.aborted += 1;
                            }
                        }
                    }
                    heal @ PlannedAction::Heal { .. } => heals.push(heal),
                    PlannedAction::Shrink {
                        photo_id,
                        drops,
                        new_locations,
                    } => match self.execute_shrink(photo_id, &drops, &new_locations, &addresses).await
                    {
                        Ok(()) => summary.shrunk += 1,
                        Err(err) => {
                            warn!(photo = %photo_id, %err, "shrink failed");
                            summary.aborted += 1;
                        }
                    },
                }
            }
        }

        // Copies dominate the tick's wall clock; run them on a bounded pool
        let results: Vec<bool> = stream::iter(heals)
            .map(|action| self.execute_heal(action, &addresses))
            .buffer_unordered(self.config.copy_workers.max(1))
            .collect()
            .await;
        for healed in results {
            if healed {
                summary.healed += 1;
            } else {
                summary.aborted += 1;
            }
        }

        debug!(?summary, "tick complete");
        Ok(summary)
    }

    /// Copy the blob to each destination, then commit the expanded set
    async fn execute_heal(&self, action: PlannedAction, addresses: &HashMap<StoreId, String>) -> bool {
        let PlannedAction::Heal {
            photo_id,
            sources,
            dests,
            mut new_locations,
            ..
        } = action
        else {
            return false;
        };

        let mut copied_all = true;
        for dest in &dests {
            let Some(dest_addr) = addresses.get(dest) else {
                copied_all = false;
                break;
            };
            if !self
                .copy_from_any(photo_id, &sources, dest_addr, addresses, &mut new_locations)
                .await
            {
                copied_all = false;
                break;
            }
        }
        if !copied_all {
            warn!(photo = %photo_id, "heal aborted before commit");
            return false;
        }

        // Abort if anything left the healthy set mid-flight; metadata is
        // only updated by the commit below
        match self.directory.stores().await {
            Ok(descriptors) => {
                let healthy = healthy_ids(&descriptors);
                if !dests.iter().all(|d| healthy.contains(d)) {
                    warn!(photo = %photo_id, "destination left healthy set; aborting heal");
                    return false;
                }
            }
            Err(err) => {
                warn!(photo = %photo_id, %err, "cannot re-check health; aborting heal");
                return false;
            }
        }

        let locations: Vec<StoreId> = new_locations.iter().copied().collect();
        match self.directory.commit(photo_id, locations).await {
            Ok(()) => {
                info!(photo = %photo_id, replicas = new_locations.len(), "healed");
                true
            }
            Err(err) => {
                warn!(photo = %photo_id, %err, "heal commit failed");
                false
            }
        }
    }

    /// Try each source until one copy succeeds
    ///
    /// A source answering corrupt or not-found is dropped from the location
    /// set being committed, so the bad replica disappears from metadata and
    /// gets re-replicated elsewhere.
    async fn copy_from_any(
        &self,
        photo_id: PhotoId,
        sources: &[StoreId],
        dest_addr: &str,
        addresses: &HashMap<StoreId, String>,
        new_locations: &mut BTreeSet<StoreId>,
    ) -> bool {
        for source in sources {
            let Some(source_addr) = addresses.get(source) else {
                continue;
            };
            let client = match StoreClient::new(source_addr) {
                Ok(client) => client,
                Err(_) => continue,
            };
            match client.copy_to(photo_id, dest_addr).await {
                Ok(()) => return true,
                Err(err) if err.is_missing_replica() => {
                    warn!(photo = %photo_id, store = %source, "replica missing on source; dropping location");
                    new_locations.remove(source);
                }
                Err(err) => {
                    debug!(photo = %photo_id, store = %source, %err, "copy attempt failed");
                }
            }
        }
        false
    }

    /// Delete the excess replicas and commit the shrunk set
    async fn execute_shrink(
        &self,
        photo_id: PhotoId,
        drops: &[StoreId],
        new_locations: &BTreeSet<StoreId>,
        addresses: &HashMap<StoreId, String>,
    ) -> Result<()> {
        for store_id in drops {
            if let Some(addr) = addresses.get(store_id) {
                let client = StoreClient::new(addr)?;
                match client.delete(photo_id).await {
                    // Already gone is fine; the goal is the location set
                    Ok(()) | Err(Error::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        let locations: Vec<StoreId> = new_locations.iter().copied().collect();
        self.directory.commit(photo_id, locations).await?;
        // The dropped stores no longer back the cached entry
        self.cache.invalidate(photo_id).await;
        info!(photo = %photo_id, dropped = drops.len(), "de-replicated");
        Ok(())
    }
}

fn healthy_ids(descriptors: &[StoreDescriptor]) -> BTreeSet<StoreId> {
    use haybale_common::StoreStatus;
    descriptors
        .iter()
        .filter(|d| d.status == StoreStatus::Healthy)
        .map(|d| d.store_id)
        .collect()
}

fn address_map(descriptors: &[StoreDescriptor]) -> HashMap<StoreId, String> {
    descriptors
        .iter()
        .map(|d| (d.store_id, d.address.clone()))
        .collect()
}
