//! Metadata store operations

use crate::tables::{META, NEXT_PHOTO_ID, PHOTOS};
use haybale_common::{Error, PhotoId, PhotoRecord, Result, StoreId};
use redb::{Database, ReadableTable, ReadableTableMetadata};
use std::path::Path;

/// Persistent photo-record store
pub struct MetaStore {
    db: Database,
}

fn db_err(err: impl std::fmt::Display) -> Error {
    Error::internal(format!("metadata store: {err}"))
}

fn codec_err(err: impl std::fmt::Display) -> Error {
    Error::Serialization(format!("photo record: {err}"))
}

impl MetaStore {
    /// Open or create the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path).map_err(db_err)?;

        // Materialize the tables so readers never race table creation
        let txn = db.begin_write().map_err(db_err)?;
        {
            txn.open_table(PHOTOS).map_err(db_err)?;
            txn.open_table(META).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;

        Ok(Self { db })
    }

    /// Allocate the next photo id (leader only)
    pub fn allocate_photo_id(&self) -> Result<PhotoId> {
        let txn = self.db.begin_write().map_err(db_err)?;
        let id = {
            let mut table = txn.open_table(META).map_err(db_err)?;
            let next = table
                .get(NEXT_PHOTO_ID)
                .map_err(db_err)?
                .map(|v| v.value())
                .unwrap_or(1);
            table.insert(NEXT_PHOTO_ID, next + 1).map_err(db_err)?;
            next
        };
        txn.commit().map_err(db_err)?;
        Ok(PhotoId::from_u64(id))
    }

    /// Insert or replace a record
    pub fn upsert(&self, record: &PhotoRecord) -> Result<()> {
        let encoded = bincode::serialize(record).map_err(codec_err)?;
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(PHOTOS).map_err(db_err)?;
            table
                .insert(record.photo_id.as_u64(), encoded.as_slice())
                .map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;
        Ok(())
    }

    /// Fetch one record
    pub fn get(&self, photo_id: PhotoId) -> Result<Option<PhotoRecord>> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(PHOTOS).map_err(db_err)?;
        match table.get(photo_id.as_u64()).map_err(db_err)? {
            Some(value) => Ok(Some(
                bincode::deserialize(value.value()).map_err(codec_err)?,
            )),
            None => Ok(None),
        }
    }

    /// Set the deleted flag; false when the record does not exist
    pub fn mark_deleted(&self, photo_id: PhotoId, now_ms: u64) -> Result<bool> {
        let Some(mut record) = self.get(photo_id)? else {
            return Ok(false);
        };
        if !record.deleted {
            record.deleted = true;
            record.updated_at_ms = now_ms;
            self.upsert(&record)?;
        }
        Ok(true)
    }

    /// Visit every record in photo-id order
    pub fn scan<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(PhotoRecord),
    {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(PHOTOS).map_err(db_err)?;
        for item in table.iter().map_err(db_err)? {
            let (_, value) = item.map_err(db_err)?;
            visit(bincode::deserialize(value.value()).map_err(codec_err)?);
        }
        Ok(())
    }

    /// Photo ids of non-deleted records locating a given store
    ///
    /// The store's GC worker treats this as the set of needles it is
    /// supposed to hold.
    pub fn photos_on_store(&self, store_id: StoreId) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        self.scan(|record| {
            if !record.deleted && record.locations.contains(&store_id) {
                ids.push(record.photo_id.as_u64());
            }
        })?;
        Ok(ids)
    }

    /// Records mutated after `since_ms`, for follower anti-entropy pulls
    pub fn changed_since(&self, since_ms: u64) -> Result<Vec<PhotoRecord>> {
        let mut changed = Vec::new();
        self.scan(|record| {
            if record.updated_at_ms > since_ms {
                changed.push(record);
            }
        })?;
        Ok(changed)
    }

    /// Apply a pushed delta (follower side), last write wins
    ///
    /// Returns how many records were newer than the local copy.
    pub fn apply_delta(&self, records: &[PhotoRecord]) -> Result<usize> {
        let mut applied = 0;
        for incoming in records {
            let keep = match self.get(incoming.photo_id)? {
                Some(local) => incoming.updated_at_ms >= local.updated_at_ms,
                None => true,
            };
            if keep {
                self.upsert(incoming)?;
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Total record count
    pub fn len(&self) -> Result<u64> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(PHOTOS).map_err(db_err)?;
        table.len().map_err(db_err)
    }

    /// Whether any records exist
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
