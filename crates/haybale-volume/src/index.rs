//! In-memory needle index
//!
//! Maps each photo to the current location of its latest needle. Rebuilt
//! from the volume files on startup; last occurrence wins and a tombstone
//! suppresses all earlier entries. Readers clone the entry under a read
//! lock and then read the volume file without holding any lock.

use haybale_common::PhotoId;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Location of the current needle for one photo
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// Volume holding the needle
    pub volume_id: u32,
    /// Offset of the record within the volume
    pub offset: u64,
    /// Payload length in bytes
    pub size: u32,
    /// Tombstoned; reads return NotFound
    pub deleted: bool,
    /// When this entry was added, milliseconds since the Unix epoch
    ///
    /// Not persisted: entries discovered during recovery carry the recovery
    /// time, which restarts the GC grace window conservatively.
    pub added_ms: u64,
}

/// Index over all volumes of one store
pub struct VolumeIndex {
    entries: RwLock<HashMap<PhotoId, IndexEntry>>,
}

impl VolumeIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Current entry for a photo
    #[must_use]
    pub fn get(&self, photo_id: PhotoId) -> Option<IndexEntry> {
        self.entries.read().get(&photo_id).copied()
    }

    /// Insert or replace the entry for a photo, returning the previous one
    pub fn insert(&self, photo_id: PhotoId, entry: IndexEntry) -> Option<IndexEntry> {
        self.entries.write().insert(photo_id, entry)
    }

    /// Remove the entry for a photo, returning it
    ///
    /// Used when a read detects corruption; the record is then treated as
    /// missing and re-replication restores it from a healthy peer.
    pub fn remove(&self, photo_id: PhotoId) -> Option<IndexEntry> {
        self.entries.write().remove(&photo_id)
    }

    /// Number of tracked photos, including tombstoned ones
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the index is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of all entries
    #[must_use]
    pub fn snapshot(&self) -> Vec<(PhotoId, IndexEntry)> {
        self.entries
            .read()
            .iter()
            .map(|(id, entry)| (*id, *entry))
            .collect()
    }

    /// Photos whose current entry lives in the given volume; input to
    /// compaction
    ///
    /// Includes tombstoned entries: a tombstone here may be suppressing a
    /// data needle in an earlier volume, so compaction must carry it over.
    #[must_use]
    pub fn current_in_volume(&self, volume_id: u32) -> Vec<(PhotoId, IndexEntry)> {
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| e.volume_id == volume_id)
            .map(|(id, entry)| (*id, *entry))
            .collect()
    }

    /// Re-point entries at their compacted offsets
    ///
    /// For each `(photo_id, old, new_offset)`, the entry is updated only if
    /// it still equals `old`: a photo re-put or deleted mid-compaction keeps
    /// its newer entry and the stale copy in the compacted file is
    /// suppressed by replay order.
    pub fn apply_compaction(&self, moves: &[(PhotoId, IndexEntry, u64)]) -> usize {
        let mut entries = self.entries.write();
        let mut applied = 0;
        for (photo_id, old, new_offset) in moves {
            if let Some(current) = entries.get_mut(photo_id) {
                if current == old {
                    current.offset = *new_offset;
                    applied += 1;
                }
            }
        }
        applied
    }
}

impl Default for VolumeIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(volume_id: u32, offset: u64) -> IndexEntry {
        IndexEntry {
            volume_id,
            offset,
            size: 10,
            deleted: false,
            added_ms: 0,
        }
    }

    #[test]
    fn test_insert_returns_previous() {
        let index = VolumeIndex::new();
        let id = PhotoId::from_u64(1);
        assert!(index.insert(id, entry(1, 0)).is_none());
        let old = index.insert(id, entry(1, 100)).unwrap();
        assert_eq!(old.offset, 0);
        assert_eq!(index.get(id).unwrap().offset, 100);
    }

    #[test]
    fn test_apply_compaction_skips_changed_entries() {
        let index = VolumeIndex::new();
        let a = PhotoId::from_u64(1);
        let b = PhotoId::from_u64(2);
        index.insert(a, entry(1, 0));
        index.insert(b, entry(1, 50));

        // b is re-put to volume 2 while compaction of volume 1 runs
        index.insert(b, entry(2, 0));

        let moves = vec![(a, entry(1, 0), 500u64), (b, entry(1, 50), 600u64)];
        assert_eq!(index.apply_compaction(&moves), 1);
        assert_eq!(index.get(a).unwrap().offset, 500);
        assert_eq!(index.get(b).unwrap(), entry(2, 0));
    }
}
