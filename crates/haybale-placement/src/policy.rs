//! Placement policy implementation
//!
//! Write placement: from the healthy stores with enough free space, pick
//! the N least-loaded, breaking ties by free space (more first) and then
//! by store id so the choice is deterministic. Eviction: drop the replica
//! on the most utilized store, with the mirrored tie-break.

use haybale_common::{Error, Result, StoreDescriptor, StoreId, StoreStatus};
use std::collections::BTreeSet;

/// Inputs to a placement decision
#[derive(Clone, Copy, Debug)]
pub struct PlacementInput {
    /// Payload size the chosen stores must accommodate
    pub size: u64,
    /// Extra free bytes required beyond the payload size
    pub margin_bytes: u64,
    /// Replicas to place
    pub replicas: usize,
}

/// Choose stores for new replicas
///
/// `exclude` removes stores that already hold the blob. Fails with
/// `InsufficientStores` when fewer eligible stores exist than requested.
pub fn choose_stores(
    input: PlacementInput,
    candidates: &[StoreDescriptor],
    exclude: &BTreeSet<StoreId>,
) -> Result<Vec<StoreId>> {
    let mut eligible: Vec<&StoreDescriptor> = candidates
        .iter()
        .filter(|d| {
            d.status == StoreStatus::Healthy
                && !exclude.contains(&d.store_id)
                && d.free_bytes >= input.size + input.margin_bytes
        })
        .collect();

    if eligible.len() < input.replicas {
        return Err(Error::InsufficientStores {
            available: eligible.len(),
            required: input.replicas,
        });
    }

    eligible.sort_by(|a, b| {
        a.ops_60s
            .cmp(&b.ops_60s)
            .then(b.free_bytes.cmp(&a.free_bytes))
            .then(a.store_id.cmp(&b.store_id))
    });

    Ok(eligible
        .into_iter()
        .take(input.replicas)
        .map(|d| d.store_id)
        .collect())
}

/// Choose which excess replica to drop
///
/// Picks the holder with the highest utilization: most ops in the window,
/// then least free space, then store id. Only stores listed in `holders`
/// are considered; holders without a descriptor are preferred for eviction
/// outright since nothing is known about them.
#[must_use]
pub fn choose_evict(
    holders: &BTreeSet<StoreId>,
    descriptors: &[StoreDescriptor],
) -> Option<StoreId> {
    // Unknown holders first: no heartbeat means no reason to keep them
    if let Some(unknown) = holders
        .iter()
        .find(|id| !descriptors.iter().any(|d| d.store_id == **id))
    {
        return Some(*unknown);
    }

    let mut known: Vec<&StoreDescriptor> = descriptors
        .iter()
        .filter(|d| holders.contains(&d.store_id))
        .collect();
    known.sort_by(|a, b| {
        b.ops_60s
            .cmp(&a.ops_60s)
            .then(a.free_bytes.cmp(&b.free_bytes))
            .then(a.store_id.cmp(&b.store_id))
    });
    known.first().map(|d| d.store_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: StoreId, status: StoreStatus, free: u64, ops: u64) -> StoreDescriptor {
        StoreDescriptor {
            store_id: id,
            address: format!("http://{id}:7100"),
            status,
            last_heartbeat_ms: 0,
            free_bytes: free,
            volume_bytes: 0,
            live_bytes: 0,
            ops_60s: ops,
        }
    }

    fn ids(n: usize) -> Vec<StoreId> {
        let mut ids: Vec<StoreId> = (0..n).map(|_| StoreId::new()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_prefers_least_loaded() {
        let ids = ids(3);
        let candidates = vec![
            descriptor(ids[0], StoreStatus::Healthy, 1000, 50),
            descriptor(ids[1], StoreStatus::Healthy, 1000, 5),
            descriptor(ids[2], StoreStatus::Healthy, 1000, 20),
        ];
        let input = PlacementInput {
            size: 10,
            margin_bytes: 0,
            replicas: 2,
        };
        let chosen = choose_stores(input, &candidates, &BTreeSet::new()).unwrap();
        assert_eq!(chosen, vec![ids[1], ids[2]]);
    }

    #[test]
    fn test_tie_broken_by_free_bytes_then_id() {
        let ids = ids(3);
        let candidates = vec![
            descriptor(ids[0], StoreStatus::Healthy, 500, 10),
            descriptor(ids[1], StoreStatus::Healthy, 900, 10),
            descriptor(ids[2], StoreStatus::Healthy, 900, 10),
        ];
        let input = PlacementInput {
            size: 10,
            margin_bytes: 0,
            replicas: 3,
        };
        let chosen = choose_stores(input, &candidates, &BTreeSet::new()).unwrap();
        // More free space first; equal free space ordered by id
        assert_eq!(chosen, vec![ids[1], ids[2], ids[0]]);
    }

    #[test]
    fn test_filters_unhealthy_and_full() {
        let ids = ids(4);
        let candidates = vec![
            descriptor(ids[0], StoreStatus::Down, 1000, 0),
            descriptor(ids[1], StoreStatus::Suspect, 1000, 0),
            descriptor(ids[2], StoreStatus::Healthy, 50, 0),
            descriptor(ids[3], StoreStatus::Healthy, 1000, 0),
        ];
        let input = PlacementInput {
            size: 100,
            margin_bytes: 10,
            replicas: 1,
        };
        let chosen = choose_stores(input, &candidates, &BTreeSet::new()).unwrap();
        assert_eq!(chosen, vec![ids[3]]);
    }

    #[test]
    fn test_excludes_existing_holders() {
        let ids = ids(2);
        let candidates = vec![
            descriptor(ids[0], StoreStatus::Healthy, 1000, 0),
            descriptor(ids[1], StoreStatus::Healthy, 1000, 0),
        ];
        let exclude: BTreeSet<StoreId> = [ids[0]].into_iter().collect();
        let input = PlacementInput {
            size: 10,
            margin_bytes: 0,
            replicas: 1,
        };
        let chosen = choose_stores(input, &candidates, &exclude).unwrap();
        assert_eq!(chosen, vec![ids[1]]);
    }

    #[test]
    fn test_insufficient_stores() {
        let ids = ids(1);
        let candidates = vec![descriptor(ids[0], StoreStatus::Healthy, 1000, 0)];
        let input = PlacementInput {
            size: 10,
            margin_bytes: 0,
            replicas: 3,
        };
        let err = choose_stores(input, &candidates, &BTreeSet::new()).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientStores {
                available: 1,
                required: 3,
            }
        ));
    }

    #[test]
    fn test_evict_picks_most_utilized() {
        let ids = ids(3);
        let descriptors = vec![
            descriptor(ids[0], StoreStatus::Healthy, 1000, 10),
            descriptor(ids[1], StoreStatus::Healthy, 1000, 90),
            descriptor(ids[2], StoreStatus::Healthy, 1000, 40),
        ];
        let holders: BTreeSet<StoreId> = ids.iter().copied().collect();
        assert_eq!(choose_evict(&holders, &descriptors), Some(ids[1]));
    }

    #[test]
    fn test_evict_prefers_unknown_holder() {
        let ids = ids(2);
        let descriptors = vec![descriptor(ids[0], StoreStatus::Healthy, 1000, 99)];
        let holders: BTreeSet<StoreId> = ids.iter().copied().collect();
        // ids[1] never heartbeated; evict it before any known store
        assert_eq!(choose_evict(&holders, &descriptors), Some(ids[1]));
    }

    #[test]
    fn test_evict_empty_holders() {
        assert_eq!(choose_evict(&BTreeSet::new(), &[]), None);
    }
}
