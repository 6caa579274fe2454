//! Blob byte cache
//!
//! LRU cache keyed by photo id, fronting store reads. Push-on-write at
//! upload time makes the read-your-own-upload path a hit. Every operation
//! is best-effort: a cache failure is logged and never fails the caller.

use crate::CoordBackend;
use bytes::Bytes;
use haybale_common::PhotoId;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Best-effort blob cache over the coordination store
pub struct BlobCache {
    backend: Arc<dyn CoordBackend>,
    ttl: Duration,
}

impl BlobCache {
    /// Create a cache handle with the given entry TTL
    pub fn new(backend: Arc<dyn CoordBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Look up cached bytes; a backend failure reads as a miss
    pub async fn get(&self, photo_id: PhotoId) -> Option<Bytes> {
        match self.backend.get_bytes(&Self::key(photo_id)).await {
            Ok(Some(bytes)) => Some(Bytes::from(bytes)),
            Ok(None) => None,
            Err(err) => {
                warn!(photo = %photo_id, %err, "cache get failed");
                None
            }
        }
    }

    /// Store bytes; failures are logged and swallowed
    pub async fn put(&self, photo_id: PhotoId, bytes: &Bytes) {
        if let Err(err) = self
            .backend
            .set_bytes(&Self::key(photo_id), bytes, self.ttl.as_millis() as u64)
            .await
        {
            warn!(photo = %photo_id, %err, "cache put failed");
        }
    }

    /// Drop the entry; failures are logged and swallowed
    pub async fn invalidate(&self, photo_id: PhotoId) {
        if let Err(err) = self.backend.del(&Self::key(photo_id)).await {
            warn!(photo = %photo_id, %err, "cache invalidate failed");
        }
    }

    fn key(photo_id: PhotoId) -> String {
        format!("cache/{photo_id}")
    }
}
