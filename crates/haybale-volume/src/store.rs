//! Store engine: volumes + index
//!
//! Owns the volume directory. One active volume takes appends; sealed
//! volumes serve reads and are compacted when their live fraction drops
//! below the efficiency threshold. Writes serialize on the active-volume
//! lock; reads clone an index entry and then read the file lock-free.

use crate::compact::{self, CompactionStats};
use crate::index::{IndexEntry, VolumeIndex};
use crate::needle::Needle;
use crate::volume::Volume;
use bytes::Bytes;
use haybale_common::types::now_ms;
use haybale_common::{checksum, Error, PhotoId, Result, StoreStats};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Engine tunables, extracted from the daemon configuration
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Directory holding the volume files
    pub data_dir: PathBuf,
    /// Seal the active volume at this size
    pub max_volume_size: u64,
    /// Disk capacity budget for this store
    pub capacity_bytes: u64,
    /// Puts fail with StoreFull when free space drops below this
    pub free_bytes_floor: u64,
    /// Live fraction below which a sealed volume is compacted
    pub compaction_efficiency_threshold: f64,
}

/// Append-only blob store over a directory of volumes
pub struct StoreEngine {
    cfg: EngineConfig,
    index: VolumeIndex,
    volumes: RwLock<HashMap<u32, Arc<Volume>>>,
    /// Write path serializer; also guards index updates for appends so that
    /// append order and index order agree for a given photo
    active: Mutex<Arc<Volume>>,
}

impl StoreEngine {
    /// Open the engine, replaying every volume in the data directory
    pub fn open(cfg: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&cfg.data_dir)?;
        compact::discard_leftovers(&cfg.data_dir)?;

        let mut ids = list_volume_ids(&cfg.data_dir)?;
        ids.sort_unstable();

        let index = VolumeIndex::new();
        let mut volumes = HashMap::new();
        let recovered_at = now_ms();

        // Replay in volume-id order; within a volume, append order. The
        // last record for a photo wins and a tombstone suppresses earlier
        // data, which makes the rebuilt index equivalent to the live one.
        for id in &ids {
            let vol = Volume::open(&cfg.data_dir, *id)?;
            let scanned = vol.recover()?;
            for record in scanned {
                index.insert(
                    record.photo_id,
                    IndexEntry {
                        volume_id: *id,
                        offset: record.offset,
                        size: record.size,
                        deleted: record.tombstone,
                        added_ms: recovered_at,
                    },
                );
            }
            volumes.insert(*id, Arc::new(vol));
        }

        // Live bytes are a property of the final index, not the replay
        let mut live: HashMap<u32, u64> = HashMap::new();
        for (_, entry) in index.snapshot() {
            if !entry.deleted {
                *live.entry(entry.volume_id).or_default() +=
                    Needle::disk_size_for(entry.size);
            }
        }
        for (id, vol) in &volumes {
            vol.live_set(live.get(id).copied().unwrap_or(0));
        }

        let active = match ids.last() {
            Some(last) if volumes[last].len() < cfg.max_volume_size => {
                Arc::clone(&volumes[last])
            }
            Some(last) => {
                let vol = Arc::new(Volume::create(&cfg.data_dir, last + 1)?);
                volumes.insert(vol.id(), Arc::clone(&vol));
                vol
            }
            None => {
                let vol = Arc::new(Volume::create(&cfg.data_dir, 1)?);
                volumes.insert(vol.id(), Arc::clone(&vol));
                vol
            }
        };

        info!(
            volumes = volumes.len(),
            photos = index.len(),
            active = active.id(),
            "store engine opened"
        );

        Ok(Self {
            cfg,
            index,
            volumes: RwLock::new(volumes),
            active: Mutex::new(active),
        })
    }

    /// Append a blob, fsync, and index it
    ///
    /// `checksum_hex` is the uploader's SHA256; a mismatch against the
    /// received bytes fails the write before anything touches disk.
    pub fn put(&self, photo_id: PhotoId, payload: Bytes, checksum_hex: &str) -> Result<()> {
        let computed = checksum::sha256_hex(&payload);
        if computed != checksum_hex {
            return Err(Error::ChecksumMismatch {
                expected: checksum_hex.to_string(),
                actual: computed,
            });
        }

        let needle = Needle::data(photo_id, payload);
        let encoded = needle.encode();

        let stats = self.stats();
        let required = encoded.len() as u64 + self.cfg.free_bytes_floor;
        if stats.free_bytes < required {
            return Err(Error::StoreFull {
                required,
                available: stats.free_bytes,
            });
        }

        let mut active = self.active.lock();
        if active.len() + encoded.len() as u64 > self.cfg.max_volume_size && !active.is_empty() {
            *active = self.roll_volume(active.id())?;
        }

        let offset = active.append(&encoded)?;
        let entry = IndexEntry {
            volume_id: active.id(),
            offset,
            size: needle.payload.len() as u32,
            deleted: false,
            added_ms: now_ms(),
        };
        let old = self.index.insert(photo_id, entry);
        active.live_add(needle.disk_size());
        drop(active);

        if let Some(old) = old {
            self.release_live(&old);
        }
        Ok(())
    }

    /// Read a blob, verifying magic and checksum
    ///
    /// A corrupt record is dropped from the index so later reads report it
    /// missing and replication can restore the replica.
    pub fn get(&self, photo_id: PhotoId) -> Result<Bytes> {
        let entry = self
            .index
            .get(photo_id)
            .ok_or(Error::NotFound(photo_id.as_u64()))?;
        if entry.deleted {
            return Err(Error::NotFound(photo_id.as_u64()));
        }

        let volume = self
            .volume(entry.volume_id)
            .ok_or_else(|| Error::internal(format!("volume {} missing", entry.volume_id)))?;

        match volume.read_needle(entry.offset) {
            Ok(needle) if needle.photo_id == photo_id && !needle.is_tombstone() => {
                Ok(needle.payload)
            }
            Ok(_) => {
                self.drop_corrupt(photo_id, &entry);
                Err(Error::Corrupt {
                    volume_id: entry.volume_id,
                    offset: entry.offset,
                })
            }
            Err(err @ (Error::Corrupt { .. } | Error::ChecksumMismatch { .. })) => {
                self.drop_corrupt(photo_id, &entry);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Append a tombstone for a blob
    pub fn delete(&self, photo_id: PhotoId) -> Result<()> {
        let active = self.active.lock();
        let old = match self.index.get(photo_id) {
            Some(entry) if !entry.deleted => entry,
            _ => return Err(Error::NotFound(photo_id.as_u64())),
        };

        let tombstone = Needle::tombstone(photo_id);
        let offset = active.append(&tombstone.encode())?;
        self.index.insert(
            photo_id,
            IndexEntry {
                volume_id: active.id(),
                offset,
                size: 0,
                deleted: true,
                added_ms: now_ms(),
            },
        );
        drop(active);

        self.release_live(&old);
        Ok(())
    }

    /// Whether a live (non-tombstoned) entry exists for a blob
    #[must_use]
    pub fn contains(&self, photo_id: PhotoId) -> bool {
        self.index.get(photo_id).is_some_and(|e| !e.deleted)
    }

    /// All live photo ids
    #[must_use]
    pub fn live_photos(&self) -> Vec<PhotoId> {
        self.index
            .snapshot()
            .into_iter()
            .filter(|(_, e)| !e.deleted)
            .map(|(id, _)| id)
            .collect()
    }

    /// Current storage statistics
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let volumes = self.volumes.read();
        let volume_bytes: u64 = volumes.values().map(|v| v.len()).sum();
        let live_bytes: u64 = volumes.values().map(|v| v.live_bytes()).sum();
        StoreStats {
            free_bytes: self.cfg.capacity_bytes.saturating_sub(volume_bytes),
            volume_bytes,
            live_bytes,
            ops_60s: 0,
        }
    }

    /// Tombstone live needles the directory does not know about
    ///
    /// Entries younger than the grace window are kept so that metadata
    /// lagging behind a recent upload never causes deletion. Returns the
    /// photos removed, for cache invalidation.
    pub fn gc(&self, known: &HashSet<u64>, grace_ms: u64) -> Result<Vec<PhotoId>> {
        let now = now_ms();
        let mut removed = Vec::new();
        for (photo_id, entry) in self.index.snapshot() {
            if entry.deleted || known.contains(&photo_id.as_u64()) {
                continue;
            }
            if now.saturating_sub(entry.added_ms) < grace_ms {
                continue;
            }
            match self.delete(photo_id) {
                Ok(()) => removed.push(photo_id),
                // Deleted concurrently; nothing to do
                Err(Error::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "gc tombstoned unknown needles");
        }
        Ok(removed)
    }

    /// Sealed volumes whose live fraction is below the efficiency threshold
    #[must_use]
    pub fn compact_eligible(&self) -> Vec<u32> {
        let active_id = self.active.lock().id();
        self.volumes
            .read()
            .values()
            .filter(|v| {
                v.id() != active_id
                    && !v.is_empty()
                    && (v.live_bytes() as f64 / v.len() as f64)
                        < self.cfg.compaction_efficiency_threshold
            })
            .map(|v| v.id())
            .collect()
    }

    /// Compact one sealed volume
    ///
    /// Interruptions before the swap leave the original volume
    /// authoritative; the temp file is discarded on the next startup.
    pub fn compact(&self, volume_id: u32) -> Result<CompactionStats> {
        if self.active.lock().id() == volume_id {
            return Err(Error::invalid_argument("cannot compact the active volume"));
        }
        let volume = self
            .volume(volume_id)
            .ok_or_else(|| Error::invalid_argument(format!("no volume {volume_id}")))?;

        let current = self.index.current_in_volume(volume_id);
        let (tmp_path, moves, stats) = compact::write_compacted(&volume, &current)?;

        // Swap boundary: replace the file, then re-point index entries.
        // Readers holding the old handle keep reading the old inode.
        compact::swap_files(&tmp_path, volume.path())?;
        let replacement = Arc::new(Volume::open(&self.cfg.data_dir, volume_id)?);

        let applied = self.index.apply_compaction(&moves);
        let applied_bytes: u64 = moves
            .iter()
            .filter(|(photo_id, old, new_offset)| {
                self.index.get(*photo_id).is_some_and(|e| {
                    e.volume_id == old.volume_id && e.offset == *new_offset && !e.deleted
                })
            })
            .map(|(_, old, _)| Needle::disk_size_for(old.size))
            .sum();
        replacement.live_set(applied_bytes);
        self.volumes.write().insert(volume_id, replacement);

        info!(
            volume = volume_id,
            kept = stats.needles_kept,
            applied,
            bytes_before = stats.bytes_before,
            bytes_after = stats.bytes_after,
            "compacted volume"
        );
        Ok(stats)
    }

    fn volume(&self, id: u32) -> Option<Arc<Volume>> {
        self.volumes.read().get(&id).cloned()
    }

    fn roll_volume(&self, current_id: u32) -> Result<Arc<Volume>> {
        let next_id = self
            .volumes
            .read()
            .keys()
            .max()
            .copied()
            .unwrap_or(current_id)
            + 1;
        let vol = Arc::new(Volume::create(&self.cfg.data_dir, next_id)?);
        self.volumes.write().insert(next_id, Arc::clone(&vol));
        info!(sealed = current_id, active = next_id, "rolled active volume");
        Ok(vol)
    }

    fn release_live(&self, old: &IndexEntry) {
        if !old.deleted {
            if let Some(vol) = self.volume(old.volume_id) {
                vol.live_sub(Needle::disk_size_for(old.size));
            }
        }
    }

    fn drop_corrupt(&self, photo_id: PhotoId, entry: &IndexEntry) {
        if self.index.remove(photo_id).is_some() {
            self.release_live(entry);
        }
    }
}

fn list_volume_ids(dir: &std::path::Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(id) = name
            .strip_prefix("vol_")
            .and_then(|rest| rest.strip_suffix(".hay"))
            .and_then(|digits| digits.parse::<u32>().ok())
        {
            ids.push(id);
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            data_dir: dir.to_path_buf(),
            max_volume_size: 64 * 1024,
            capacity_bytes: 4 * 1024 * 1024,
            free_bytes_floor: 0,
            compaction_efficiency_threshold: 0.6,
        }
    }

    fn put(engine: &StoreEngine, id: u64, payload: &[u8]) {
        engine
            .put(
                PhotoId::from_u64(id),
                Bytes::copy_from_slice(payload),
                &checksum::sha256_hex(payload),
            )
            .unwrap();
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StoreEngine::open(test_config(dir.path())).unwrap();

        put(&engine, 42, b"HELLO");
        assert_eq!(engine.get(PhotoId::from_u64(42)).unwrap().as_ref(), b"HELLO");
    }

    #[test]
    fn test_put_rejects_wrong_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StoreEngine::open(test_config(dir.path())).unwrap();

        let err = engine
            .put(
                PhotoId::from_u64(1),
                Bytes::from_static(b"data"),
                "deadbeef",
            )
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(!engine.contains(PhotoId::from_u64(1)));
    }

    #[test]
    fn test_later_put_wins() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StoreEngine::open(test_config(dir.path())).unwrap();

        put(&engine, 5, b"first");
        put(&engine, 5, b"second");
        assert_eq!(engine.get(PhotoId::from_u64(5)).unwrap().as_ref(), b"second");
    }

    #[test]
    fn test_delete_then_get_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StoreEngine::open(test_config(dir.path())).unwrap();

        put(&engine, 7, b"X");
        engine.delete(PhotoId::from_u64(7)).unwrap();
        assert!(matches!(
            engine.get(PhotoId::from_u64(7)),
            Err(Error::NotFound(7))
        ));
        assert!(matches!(
            engine.delete(PhotoId::from_u64(7)),
            Err(Error::NotFound(7))
        ));
    }

    #[test]
    fn test_tombstone_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = StoreEngine::open(test_config(dir.path())).unwrap();
            put(&engine, 7, b"X");
            engine.delete(PhotoId::from_u64(7)).unwrap();
        }
        let engine = StoreEngine::open(test_config(dir.path())).unwrap();
        assert!(matches!(
            engine.get(PhotoId::from_u64(7)),
            Err(Error::NotFound(7))
        ));
    }

    #[test]
    fn test_restart_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = StoreEngine::open(test_config(dir.path())).unwrap();
            put(&engine, 1, b"one");
            put(&engine, 2, b"two");
            put(&engine, 1, b"uno");
        }
        let engine = StoreEngine::open(test_config(dir.path())).unwrap();
        assert_eq!(engine.get(PhotoId::from_u64(1)).unwrap().as_ref(), b"uno");
        assert_eq!(engine.get(PhotoId::from_u64(2)).unwrap().as_ref(), b"two");
    }

    #[test]
    fn test_active_volume_rolls_at_max_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.max_volume_size = 256;
        let engine = StoreEngine::open(cfg).unwrap();

        for id in 0..8 {
            put(&engine, id, &[0u8; 100]);
        }
        assert!(engine.volumes.read().len() > 1);
        for id in 0..8 {
            assert!(engine.get(PhotoId::from_u64(id)).is_ok());
        }
    }

    #[test]
    fn test_store_full() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.capacity_bytes = 512;
        let engine = StoreEngine::open(cfg).unwrap();

        let payload = [0u8; 600];
        let err = engine
            .put(
                PhotoId::from_u64(1),
                Bytes::copy_from_slice(&payload),
                &checksum::sha256_hex(&payload),
            )
            .unwrap_err();
        assert!(matches!(err, Error::StoreFull { .. }));
    }

    #[test]
    fn test_compaction_preserves_live_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        // Large enough to hold everything in volume 1
        cfg.max_volume_size = 1024 * 1024;
        let engine = StoreEngine::open(cfg).unwrap();

        for id in 0..100 {
            put(&engine, id, format!("payload-{id}").as_bytes());
        }
        for id in (0..100).step_by(2) {
            engine.delete(PhotoId::from_u64(id)).unwrap();
        }

        // Seal volume 1 by forcing a roll
        {
            let mut active = engine.active.lock();
            let sealed_id = active.id();
            *active = engine.roll_volume(sealed_id).unwrap();
        }

        let eligible = engine.compact_eligible();
        assert!(eligible.contains(&1));

        let before = engine.stats();
        let stats = engine.compact(1).unwrap();
        assert!(stats.bytes_after < stats.bytes_before);
        // 50 live needles plus their 50 suppressing tombstones
        assert_eq!(stats.needles_kept, 100);

        let after = engine.stats();
        assert!(after.volume_bytes < before.volume_bytes);

        for id in 0..100 {
            let result = engine.get(PhotoId::from_u64(id));
            if id % 2 == 0 {
                assert!(matches!(result, Err(Error::NotFound(_))), "id {id}");
            } else {
                assert_eq!(
                    result.unwrap().as_ref(),
                    format!("payload-{id}").as_bytes(),
                    "id {id}"
                );
            }
        }
    }

    #[test]
    fn test_compaction_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.max_volume_size = 1024 * 1024;
        {
            let engine = StoreEngine::open(cfg.clone()).unwrap();
            for id in 0..20 {
                put(&engine, id, b"0123456789");
            }
            for id in 0..10 {
                engine.delete(PhotoId::from_u64(id)).unwrap();
            }
            let mut active = engine.active.lock();
            let sealed_id = active.id();
            *active = engine.roll_volume(sealed_id).unwrap();
            drop(active);
            engine.compact(1).unwrap();
        }
        let engine = StoreEngine::open(cfg).unwrap();
        for id in 0..20 {
            let result = engine.get(PhotoId::from_u64(id));
            if id < 10 {
                assert!(matches!(result, Err(Error::NotFound(_))));
            } else {
                assert_eq!(result.unwrap().as_ref(), b"0123456789");
            }
        }
    }

    #[test]
    fn test_compacted_tombstone_still_suppresses_older_volume() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        {
            let engine = StoreEngine::open(cfg.clone()).unwrap();
            put(&engine, 1, b"zombie-candidate");

            // Roll so the data needle is sealed in volume 1, then delete:
            // the tombstone lands in volume 2
            {
                let mut active = engine.active.lock();
                let sealed_id = active.id();
                *active = engine.roll_volume(sealed_id).unwrap();
            }
            engine.delete(PhotoId::from_u64(1)).unwrap();

            // Seal volume 2 and compact it; the tombstone must survive
            {
                let mut active = engine.active.lock();
                let sealed_id = active.id();
                *active = engine.roll_volume(sealed_id).unwrap();
            }
            engine.compact(2).unwrap();
        }

        let engine = StoreEngine::open(cfg).unwrap();
        assert!(matches!(
            engine.get(PhotoId::from_u64(1)),
            Err(Error::NotFound(1))
        ));
    }

    #[test]
    fn test_interrupted_compaction_leftover_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        {
            let engine = StoreEngine::open(cfg.clone()).unwrap();
            put(&engine, 1, b"survivor");
        }
        // Crash mid-compaction leaves a temp file behind
        std::fs::write(dir.path().join("vol_000001.hay.compact"), b"partial").unwrap();

        let engine = StoreEngine::open(cfg).unwrap();
        assert!(!dir.path().join("vol_000001.hay.compact").exists());
        assert_eq!(
            engine.get(PhotoId::from_u64(1)).unwrap().as_ref(),
            b"survivor"
        );
    }

    #[test]
    fn test_gc_respects_known_set_and_grace() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StoreEngine::open(test_config(dir.path())).unwrap();

        put(&engine, 1, b"known");
        put(&engine, 2, b"orphan");

        let known: HashSet<u64> = [1].into_iter().collect();

        // Within the grace window nothing is removed
        let removed = engine.gc(&known, 60_000).unwrap();
        assert!(removed.is_empty());

        // With no grace the orphan goes
        let removed = engine.gc(&known, 0).unwrap();
        assert_eq!(removed, vec![PhotoId::from_u64(2)]);
        assert!(engine.contains(PhotoId::from_u64(1)));
        assert!(!engine.contains(PhotoId::from_u64(2)));
    }

    #[test]
    fn test_live_bytes_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StoreEngine::open(test_config(dir.path())).unwrap();

        put(&engine, 1, b"0123456789");
        let live_one = engine.stats().live_bytes;
        assert_eq!(live_one, Needle::disk_size_for(10));

        put(&engine, 1, b"replacement-bytes");
        assert_eq!(engine.stats().live_bytes, Needle::disk_size_for(17));

        engine.delete(PhotoId::from_u64(1)).unwrap();
        assert_eq!(engine.stats().live_bytes, 0);
    }
}
