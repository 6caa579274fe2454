//! Replication planning
//!
//! Pure decision logic: given the metadata records and the current store
//! descriptors, emit the actions that move every blob toward its desired
//! replica count. Execution lives in the manager; keeping the planning
//! side-effect free makes the convergence rules directly testable.

use haybale_common::api::ScanRecord;
use haybale_common::{PhotoId, StoreDescriptor, StoreId};
use haybale_placement::{choose_evict, choose_stores, PlacementInput};
use std::collections::BTreeSet;
use tracing::debug;

/// One planned replication action
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlannedAction {
    /// Raise or lower a blob's target replica count
    AdjustDesired {
        /// Blob to adjust
        photo_id: PhotoId,
        /// New target
        desired: u32,
    },
    /// Copy a blob from a healthy holder to new stores
    Heal {
        /// Blob to heal
        photo_id: PhotoId,
        /// Payload size, for placement
        size: u64,
        /// Healthy holders to read from, in preference order
        sources: Vec<StoreId>,
        /// Stores to copy to
        dests: Vec<StoreId>,
        /// Location set to commit once every copy succeeded
        new_locations: BTreeSet<StoreId>,
    },
    /// Delete excess replicas
    Shrink {
        /// Blob to shrink
        photo_id: PhotoId,
        /// Holders to delete from, most utilized first
        drops: Vec<StoreId>,
        /// Location set to commit after the drops
        new_locations: BTreeSet<StoreId>,
    },
}

/// Inputs shared by every planning decision in one tick
pub struct PlanContext<'a> {
    /// Current store descriptors
    pub descriptors: &'a [StoreDescriptor],
    /// Stores considered healthy this tick
    pub healthy: BTreeSet<StoreId>,
    /// Placement free-space margin
    pub margin_bytes: u64,
    /// Baseline replica count for cold blobs
    pub default_replicas: u32,
    /// Ceiling for hot blobs
    pub max_replicas: u32,
}

/// Plan the actions for one scanned record
pub fn plan_record(scan: &ScanRecord, ctx: &PlanContext<'_>) -> Vec<PlannedAction> {
    let record = &scan.record;
    if record.deleted {
        // GC drains deleted blobs; replication leaves them alone
        return Vec::new();
    }

    let mut actions = Vec::new();

    // Hot blobs spread to more replicas; cold ones sink back
    let desired = if scan.hot {
        ctx.max_replicas
    } else if record.desired_replicas > ctx.default_replicas {
        ctx.default_replicas
    } else {
        record.desired_replicas
    };
    if desired != record.desired_replicas {
        actions.push(PlannedAction::AdjustDesired {
            photo_id: record.photo_id,
            desired,
        });
    }

    let healthy_locations = record.healthy_locations(&ctx.healthy);
    let healthy_count = healthy_locations.len() as u32;

    if healthy_count < desired {
        if healthy_locations.is_empty() {
            // Nothing to copy from; only a store resurrection can help
            debug!(photo = %record.photo_id, "no healthy source; cannot heal");
            return actions;
        }

        let missing = (desired - healthy_count) as usize;
        let exclude: BTreeSet<StoreId> = record.locations.clone();
        let dests = match choose_stores(
            PlacementInput {
                size: record.size,
                margin_bytes: ctx.margin_bytes,
                replicas: missing,
            },
            ctx.descriptors,
            &exclude,
        ) {
            Ok(dests) => dests,
            Err(err) => {
                // Not enough capacity this tick; the audit retries later
                debug!(photo = %record.photo_id, %err, "placement failed");
                return actions;
            }
        };

        // Prefer the least-loaded healthy holder as the copy source
        let mut sources: Vec<StoreId> = healthy_locations.iter().copied().collect();
        sources.sort_by_key(|id| {
            ctx.descriptors
                .iter()
                .find(|d| d.store_id == *id)
                .map(|d| d.ops_60s)
                .unwrap_or(u64::MAX)
        });

        let mut new_locations = record.locations.clone();
        new_locations.extend(dests.iter().copied());
        actions.push(PlannedAction::Heal {
            photo_id: record.photo_id,
            size: record.size,
            sources,
            dests,
            new_locations,
        });
    } else if (record.locations.len() as u32) > desired {
        let mut remaining = record.locations.clone();
        let mut drops = Vec::new();
        while (remaining.len() as u32) > desired {
            // Shed the most utilized replica; never go below desired
            let Some(evict) = choose_evict(&remaining, ctx.descriptors) else {
                break;
            };
            remaining.remove(&evict);
            drops.push(evict);
        }
        if !drops.is_empty() {
            actions.push(PlannedAction::Shrink {
                photo_id: record.photo_id,
                drops,
                new_locations: remaining,
            });
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use haybale_common::{PhotoRecord, StoreStatus};

    fn descriptor(id: StoreId, free: u64, ops: u64) -> StoreDescriptor {
        StoreDescriptor {
            store_id: id,
            address: format!("http://{id}:7100"),
            status: StoreStatus::Healthy,
            last_heartbeat_ms: 0,
            free_bytes: free,
            volume_bytes: 0,
            live_bytes: 0,
            ops_60s: ops,
        }
    }

    fn record(id: u64, desired: u32, locations: &[StoreId]) -> PhotoRecord {
        let mut record = PhotoRecord::new(PhotoId::from_u64(id), 100, "ab".into(), desired, 0);
        record.locations.extend(locations.iter().copied());
        record
    }

    fn sorted_ids(n: usize) -> Vec<StoreId> {
        let mut ids: Vec<StoreId> = (0..n).map(|_| StoreId::new()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_under_replicated_heals() {
        let ids = sorted_ids(4);
        let descriptors: Vec<StoreDescriptor> =
            ids.iter().map(|id| descriptor(*id, 1 << 30, 0)).collect();
        let ctx = PlanContext {
            descriptors: &descriptors,
            healthy: ids.iter().copied().collect(),
            margin_bytes: 0,
            default_replicas: 3,
            max_replicas: 5,
        };

        let scan = ScanRecord {
            record: record(1, 3, &ids[..1]),
            hot: false,
        };
        let actions = plan_record(&scan, &ctx);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            PlannedAction::Heal {
                sources,
                dests,
                new_locations,
                ..
            } => {
                assert_eq!(sources, &vec![ids[0]]);
                assert_eq!(dests.len(), 2);
                assert!(!dests.contains(&ids[0]));
                assert_eq!(new_locations.len(), 3);
            }
            other => panic!("expected Heal, got {other:?}"),
        }
    }

    #[test]
    fn test_unhealthy_location_counts_as_missing() {
        let ids = sorted_ids(4);
        let descriptors: Vec<StoreDescriptor> =
            ids.iter().map(|id| descriptor(*id, 1 << 30, 0)).collect();
        // ids[1] holds a replica but is not healthy this tick
        let healthy: BTreeSet<StoreId> = [ids[0], ids[2], ids[3]].into_iter().collect();
        let ctx = PlanContext {
            descriptors: &descriptors,
            healthy,
            margin_bytes: 0,
            default_replicas: 2,
            max_replicas: 5,
        };

        let scan = ScanRecord {
            record: record(1, 2, &ids[..2]),
            hot: false,
        };
        let actions = plan_record(&scan, &ctx);
        match &actions[0] {
            PlannedAction::Heal { sources, dests, .. } => {
                assert_eq!(sources, &vec![ids[0]]);
                // The down holder is excluded both as source and dest
                assert!(!dests.contains(&ids[1]));
            }
            other => panic!("expected Heal, got {other:?}"),
        }
    }

    #[test]
    fn test_no_healthy_source_skips() {
        let ids = sorted_ids(3);
        let descriptors: Vec<StoreDescriptor> =
            ids.iter().map(|id| descriptor(*id, 1 << 30, 0)).collect();
        let healthy: BTreeSet<StoreId> = [ids[1], ids[2]].into_iter().collect();
        let ctx = PlanContext {
            descriptors: &descriptors,
            healthy,
            margin_bytes: 0,
            default_replicas: 2,
            max_replicas: 5,
        };

        // Only holder is unhealthy; no copy source exists
        let scan = ScanRecord {
            record: record(1, 2, &ids[..1]),
            hot: false,
        };
        assert!(plan_record(&scan, &ctx).is_empty());
    }

    #[test]
    fn test_over_replicated_shrinks_most_utilized_first() {
        let ids = sorted_ids(5);
        let ops = [10u64, 90, 40, 70, 5];
        let descriptors: Vec<StoreDescriptor> = ids
            .iter()
            .zip(ops)
            .map(|(id, ops)| descriptor(*id, 1 << 30, ops))
            .collect();
        let ctx = PlanContext {
            descriptors: &descriptors,
            healthy: ids.iter().copied().collect(),
            margin_bytes: 0,
            default_replicas: 3,
            max_replicas: 5,
        };

        let scan = ScanRecord {
            record: record(1, 3, &ids),
            hot: false,
        };
        let actions = plan_record(&scan, &ctx);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            PlannedAction::Shrink {
                drops,
                new_locations,
                ..
            } => {
                // The two most utilized stores are shed, busiest first
                assert_eq!(drops, &vec![ids[1], ids[3]]);
                assert_eq!(new_locations.len(), 3);
            }
            other => panic!("expected Shrink, got {other:?}"),
        }
    }

    #[test]
    fn test_hot_blob_raises_desired() {
        let ids = sorted_ids(6);
        let descriptors: Vec<StoreDescriptor> =
            ids.iter().map(|id| descriptor(*id, 1 << 30, 0)).collect();
        let ctx = PlanContext {
            descriptors: &descriptors,
            healthy: ids.iter().copied().collect(),
            margin_bytes: 0,
            default_replicas: 3,
            max_replicas: 5,
        };

        let scan = ScanRecord {
            record: record(1, 3, &ids[..3]),
            hot: true,
        };
        let actions = plan_record(&scan, &ctx);
        assert!(actions.contains(&PlannedAction::AdjustDesired {
            photo_id: PhotoId::from_u64(1),
            desired: 5,
        }));
        // And heals up to the raised target
        assert!(actions.iter().any(|a| matches!(
            a,
            PlannedAction::Heal { dests, .. } if dests.len() == 2
        )));
    }

    #[test]
    fn test_cold_blob_lowers_desired_and_shrinks() {
        let ids = sorted_ids(5);
        let descriptors: Vec<StoreDescriptor> =
            ids.iter().map(|id| descriptor(*id, 1 << 30, 0)).collect();
        let ctx = PlanContext {
            descriptors: &descriptors,
            healthy: ids.iter().copied().collect(),
            margin_bytes: 0,
            default_replicas: 3,
            max_replicas: 5,
        };

        let scan = ScanRecord {
            record: record(1, 5, &ids),
            hot: false,
        };
        let actions = plan_record(&scan, &ctx);
        assert!(actions.contains(&PlannedAction::AdjustDesired {
            photo_id: PhotoId::from_u64(1),
            desired: 3,
        }));
        assert!(actions.iter().any(|a| matches!(
            a,
            PlannedAction::Shrink { new_locations, .. } if new_locations.len() == 3
        )));
    }

    #[test]
    fn test_balanced_record_yields_nothing() {
        let ids = sorted_ids(3);
        let descriptors: Vec<StoreDescriptor> =
            ids.iter().map(|id| descriptor(*id, 1 << 30, 0)).collect();
        let ctx = PlanContext {
            descriptors: &descriptors,
            healthy: ids.iter().copied().collect(),
            margin_bytes: 0,
            default_replicas: 3,
            max_replicas: 5,
        };

        let scan = ScanRecord {
            record: record(1, 3, &ids),
            hot: false,
        };
        assert!(plan_record(&scan, &ctx).is_empty());
    }

    #[test]
    fn test_deleted_record_ignored() {
        let ids = sorted_ids(3);
        let descriptors: Vec<StoreDescriptor> =
            ids.iter().map(|id| descriptor(*id, 1 << 30, 0)).collect();
        let ctx = PlanContext {
            descriptors: &descriptors,
            healthy: ids.iter().copied().collect(),
            margin_bytes: 0,
            default_replicas: 3,
            max_replicas: 5,
        };

        let mut rec = record(1, 3, &ids[..1]);
        rec.deleted = true;
        let scan = ScanRecord {
            record: rec,
            hot: false,
        };
        assert!(plan_record(&scan, &ctx).is_empty());
    }
}
