//! Append-only volume files
//!
//! One volume is one file of consecutive needles. A single writer appends
//! under a lock and fsyncs before acknowledging; readers use positioned
//! reads against a shared handle and never take the write lock.

use crate::needle::{self, Needle, HEADER_LEN};
use haybale_common::{Error, PhotoId, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// One append-only volume file
pub struct Volume {
    id: u32,
    path: PathBuf,
    /// Shared read handle; positioned reads only
    reader: File,
    /// Append handle; one writer at a time
    writer: Mutex<File>,
    /// Current file length
    len: AtomicU64,
    /// Bytes of needles that are the current live version of their photo
    live_bytes: AtomicU64,
}

/// One record located during a recovery scan
#[derive(Clone, Copy, Debug)]
pub struct ScannedNeedle {
    /// Blob identity
    pub photo_id: PhotoId,
    /// Offset of the record within the volume
    pub offset: u64,
    /// Payload length
    pub size: u32,
    /// Tombstone flag
    pub tombstone: bool,
}

impl Volume {
    /// Create a new empty volume file
    pub fn create(dir: &Path, id: u32) -> Result<Self> {
        let path = Self::file_path(dir, id);
        let writer = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        let reader = File::open(&path)?;

        // Persist the directory entry so the volume survives a crash
        File::open(dir)?.sync_all()?;

        Ok(Self {
            id,
            path,
            reader,
            writer: Mutex::new(writer),
            len: AtomicU64::new(0),
            live_bytes: AtomicU64::new(0),
        })
    }

    /// Open an existing volume file
    pub fn open(dir: &Path, id: u32) -> Result<Self> {
        let path = Self::file_path(dir, id);
        let writer = OpenOptions::new().append(true).open(&path)?;
        let reader = File::open(&path)?;
        let len = reader.metadata()?.len();

        Ok(Self {
            id,
            path,
            reader,
            writer: Mutex::new(writer),
            len: AtomicU64::new(len),
            live_bytes: AtomicU64::new(0),
        })
    }

    /// Path of the volume file with the given id
    #[must_use]
    pub fn file_path(dir: &Path, id: u32) -> PathBuf {
        dir.join(format!("vol_{id:06}.hay"))
    }

    /// Volume id
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Backing file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length in bytes
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the volume holds no needles
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of current live needles
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::Acquire)
    }

    /// Add to the live byte count
    pub fn live_add(&self, bytes: u64) {
        self.live_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Subtract from the live byte count
    pub fn live_sub(&self, bytes: u64) {
        let mut current = self.live_bytes.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self.live_bytes.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Set the live byte count outright (used after compaction swap)
    pub fn live_set(&self, bytes: u64) {
        self.live_bytes.store(bytes, Ordering::Release);
    }

    /// Append an encoded needle, fsync, and return its offset
    ///
    /// The index must not be updated unless this returns Ok; a failed write
    /// leaves the tail to be truncated by the next recovery scan.
    pub fn append(&self, encoded: &[u8]) -> Result<u64> {
        let mut writer = self.writer.lock();
        let offset = self.len.load(Ordering::Acquire);
        writer.write_all(encoded)?;
        writer.flush()?;
        writer.sync_data()?;
        self.len
            .store(offset + encoded.len() as u64, Ordering::Release);
        Ok(offset)
    }

    /// Read and verify the needle at `offset`
    pub fn read_needle(&self, offset: u64) -> Result<Needle> {
        let mut header = [0u8; HEADER_LEN];
        self.reader
            .read_exact_at(&mut header, offset)
            .map_err(|_| Error::Corrupt {
                volume_id: self.id,
                offset,
            })?;
        let parsed = needle::parse_header(&header, self.id, offset)?;

        let total = Needle::disk_size_for(parsed.size) as usize;
        let mut record = vec![0u8; total];
        self.reader
            .read_exact_at(&mut record, offset)
            .map_err(|_| Error::Corrupt {
                volume_id: self.id,
                offset,
            })?;
        Needle::decode(&record, self.id, offset)
    }

    /// Scan the volume sequentially, validating every needle
    ///
    /// Returns the located records in append order. A malformed or partial
    /// record ends the scan and the file is truncated there: a crash between
    /// append and fsync must not leave a visible needle.
    pub fn recover(&self) -> Result<Vec<ScannedNeedle>> {
        let file_len = self.reader.metadata()?.len();
        let mut entries = Vec::new();
        let mut offset = 0u64;

        while offset < file_len {
            let valid = self.scan_one(offset, file_len);
            match valid {
                Some(scanned) => {
                    offset += Needle::disk_size_for(scanned.size);
                    entries.push(scanned);
                }
                None => {
                    warn!(
                        volume = self.id,
                        offset,
                        file_len,
                        "truncating torn tail during volume recovery"
                    );
                    self.truncate(offset)?;
                    break;
                }
            }
        }

        self.len.store(offset.min(file_len), Ordering::Release);
        Ok(entries)
    }

    /// Validate one record at `offset`; None means the tail is torn
    fn scan_one(&self, offset: u64, file_len: u64) -> Option<ScannedNeedle> {
        if offset + HEADER_LEN as u64 > file_len {
            return None;
        }
        let mut header = [0u8; HEADER_LEN];
        self.reader.read_exact_at(&mut header, offset).ok()?;
        let parsed = needle::parse_header(&header, self.id, offset).ok()?;

        let total = Needle::disk_size_for(parsed.size);
        if offset + total > file_len {
            return None;
        }
        let mut record = vec![0u8; total as usize];
        self.reader.read_exact_at(&mut record, offset).ok()?;
        let needle = Needle::decode(&record, self.id, offset).ok()?;

        Some(ScannedNeedle {
            photo_id: needle.photo_id,
            offset,
            size: parsed.size,
            tombstone: needle.is_tombstone(),
        })
    }

    /// Truncate the file at `offset`
    fn truncate(&self, offset: u64) -> Result<()> {
        let writer = self.writer.lock();
        writer.set_len(offset)?;
        writer.sync_data()?;
        self.len.store(offset, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let vol = Volume::create(dir.path(), 1).unwrap();

        let needle = Needle::data(PhotoId::from_u64(9), Bytes::from_static(b"bytes"));
        let offset = vol.append(&needle.encode()).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(vol.len(), needle.disk_size());

        let read = vol.read_needle(offset).unwrap();
        assert_eq!(read, needle);
    }

    #[test]
    fn test_recover_full_volume() {
        let dir = tempfile::tempdir().unwrap();
        let vol = Volume::create(dir.path(), 1).unwrap();

        let a = Needle::data(PhotoId::from_u64(1), Bytes::from_static(b"aa"));
        let b = Needle::tombstone(PhotoId::from_u64(1));
        vol.append(&a.encode()).unwrap();
        vol.append(&b.encode()).unwrap();

        let reopened = Volume::open(dir.path(), 1).unwrap();
        let scanned = reopened.recover().unwrap();
        assert_eq!(scanned.len(), 2);
        assert!(!scanned[0].tombstone);
        assert!(scanned[1].tombstone);
        assert_eq!(scanned[1].offset, a.disk_size());
    }

    #[test]
    fn test_recover_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let vol = Volume::create(dir.path(), 1).unwrap();

        let a = Needle::data(PhotoId::from_u64(1), Bytes::from_static(b"intact"));
        vol.append(&a.encode()).unwrap();

        // Simulate a crash mid-append: write half of a second record
        let b = Needle::data(PhotoId::from_u64(2), Bytes::from_static(b"torn")).encode();
        vol.append(&b[..b.len() / 2].to_vec()).unwrap();

        let reopened = Volume::open(dir.path(), 1).unwrap();
        let scanned = reopened.recover().unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].photo_id, PhotoId::from_u64(1));
        assert_eq!(reopened.len(), a.disk_size());
    }

    #[test]
    fn test_recover_stops_at_corrupted_record() {
        let dir = tempfile::tempdir().unwrap();
        let vol = Volume::create(dir.path(), 1).unwrap();

        let a = Needle::data(PhotoId::from_u64(1), Bytes::from_static(b"ok"));
        vol.append(&a.encode()).unwrap();
        let mut bad = Needle::data(PhotoId::from_u64(2), Bytes::from_static(b"bad"))
            .encode()
            .to_vec();
        bad[0] = b'X';
        vol.append(&bad).unwrap();

        let reopened = Volume::open(dir.path(), 1).unwrap();
        let scanned = reopened.recover().unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(reopened.len(), a.disk_size());
    }
}
