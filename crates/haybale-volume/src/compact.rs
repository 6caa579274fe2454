//! Sealed-volume compaction
//!
//! Rewrites a sealed volume keeping only the current needle per photo,
//! then atomically replaces the old file. Superseded data needles are
//! dropped; current tombstones are carried over because they may suppress
//! data needles in earlier volumes on replay. The old volume remains
//! authoritative until the swap: a crash at any earlier step leaves a
//! `.compact` temp file that startup discards.

use crate::index::IndexEntry;
use crate::needle::Needle;
use crate::volume::Volume;
use haybale_common::{PhotoId, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Extension of the in-progress compaction output
pub const COMPACT_EXT: &str = "compact";

/// Outcome of one volume compaction
#[derive(Clone, Copy, Debug, Default)]
pub struct CompactionStats {
    /// Needles copied into the new file
    pub needles_kept: u32,
    /// Needles skipped because they failed verification
    pub needles_dropped: u32,
    /// Volume bytes before
    pub bytes_before: u64,
    /// Volume bytes after
    pub bytes_after: u64,
}

/// A needle relocation produced by the write phase
pub type NeedleMove = (PhotoId, IndexEntry, u64);

/// Write the compacted replacement file for `src`
///
/// Copies the needle for every entry in `current` (the photos whose
/// current index entry points into `src`, tombstones included), verifying
/// each record on the way. Returns the temp path, the index moves, and
/// the stats. Does not touch the index or the original file.
pub fn write_compacted(
    src: &Volume,
    current: &[(PhotoId, IndexEntry)],
) -> Result<(PathBuf, Vec<NeedleMove>, CompactionStats)> {
    let tmp_path = compact_path(src.path());
    // A leftover from an interrupted run is stale; start over
    let _ = std::fs::remove_file(&tmp_path);

    let mut out = OpenOptions::new()
        .create_new(true)
        .append(true)
        .open(&tmp_path)?;

    let mut moves = Vec::with_capacity(current.len());
    let mut stats = CompactionStats {
        bytes_before: src.len(),
        ..Default::default()
    };
    let mut new_offset = 0u64;

    for (photo_id, entry) in current {
        match src.read_needle(entry.offset) {
            Ok(needle) => {
                let encoded = needle.encode();
                out.write_all(&encoded)?;
                moves.push((*photo_id, *entry, new_offset));
                new_offset += encoded.len() as u64;
                stats.needles_kept += 1;
            }
            Err(err) => {
                // Unreadable needles are dropped; replication restores them
                warn!(
                    volume = src.id(),
                    photo = %photo_id,
                    offset = entry.offset,
                    %err,
                    "dropping unreadable needle during compaction"
                );
                stats.needles_dropped += 1;
            }
        }
    }

    out.flush()?;
    out.sync_data()?;
    stats.bytes_after = new_offset;
    Ok((tmp_path, moves, stats))
}

/// Atomically replace the old volume file with the compacted one
///
/// Open handles to the old file keep reading the old contents; only new
/// lookups see the replacement.
pub fn swap_files(tmp_path: &Path, volume_path: &Path) -> Result<()> {
    std::fs::rename(tmp_path, volume_path)?;
    if let Some(dir) = volume_path.parent() {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

/// Remove leftover `.compact` files from interrupted runs
pub fn discard_leftovers(dir: &Path) -> Result<u32> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some(COMPACT_EXT) {
            warn!(?path, "discarding interrupted compaction output");
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn compact_path(volume_path: &Path) -> PathBuf {
    let mut name = volume_path.as_os_str().to_os_string();
    name.push(".");
    name.push(COMPACT_EXT);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_write_compacted_keeps_only_live() {
        let dir = tempfile::tempdir().unwrap();
        let vol = Volume::create(dir.path(), 1).unwrap();

        let keep = Needle::data(PhotoId::from_u64(1), Bytes::from_static(b"keep"));
        let drop_ = Needle::data(PhotoId::from_u64(2), Bytes::from_static(b"dead"));
        let keep_offset = vol.append(&keep.encode()).unwrap();
        vol.append(&drop_.encode()).unwrap();

        let live = vec![(
            PhotoId::from_u64(1),
            IndexEntry {
                volume_id: 1,
                offset: keep_offset,
                size: 4,
                deleted: false,
                added_ms: 0,
            },
        )];

        let (tmp, moves, stats) = write_compacted(&vol, &live).unwrap();
        assert_eq!(stats.needles_kept, 1);
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].2, 0);
        assert!(stats.bytes_after < stats.bytes_before);
        assert!(tmp.exists());
    }

    #[test]
    fn test_discard_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vol_000001.hay.compact"), b"junk").unwrap();
        std::fs::write(dir.path().join("vol_000001.hay"), b"").unwrap();

        assert_eq!(discard_leftovers(dir.path()).unwrap(), 1);
        assert!(!dir.path().join("vol_000001.hay.compact").exists());
        assert!(dir.path().join("vol_000001.hay").exists());
    }
}
