//! Leader lease
//!
//! Single-writer lease over a well-known key: create-if-absent with TTL
//! elects a leader, periodic compare-and-refresh keeps it, and silence
//! lets any candidate re-acquire after expiry. This is not consensus;
//! split-brain exposure is bounded by the TTL and clock skew.

use crate::CoordBackend;
use haybale_common::Result;
use std::sync::Arc;
use std::time::Duration;

/// TTL'd lease on a coordination-store key
pub struct LeaderLease {
    backend: Arc<dyn CoordBackend>,
    key: String,
    /// Value written under the key; the holder's advertised address
    id: String,
    ttl: Duration,
}

impl LeaderLease {
    /// Create a lease handle; nothing is acquired yet
    pub fn new(
        backend: Arc<dyn CoordBackend>,
        key: impl Into<String>,
        id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            backend,
            key: key.into(),
            id: id.into(),
            ttl,
        }
    }

    /// The value this candidate writes under the lease key
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// How often a holder should refresh: a third of the TTL
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        self.ttl / 3
    }

    /// Attempt to take the lease; true on success
    pub async fn try_acquire(&self) -> Result<bool> {
        self.backend
            .acquire(&self.key, &self.id, self.ttl.as_millis() as u64)
            .await
    }

    /// Extend the lease; false means it was lost and the holder must demote
    pub async fn refresh(&self) -> Result<bool> {
        self.backend
            .refresh_if_value(&self.key, &self.id, self.ttl.as_millis() as u64)
            .await
    }

    /// Release the lease if still held; used on clean shutdown
    pub async fn release(&self) -> Result<bool> {
        self.backend.release_if_value(&self.key, &self.id).await
    }

    /// Read the current holder, if any
    pub async fn current_holder(&self) -> Result<Option<String>> {
        self.backend.get(&self.key).await
    }

    /// Whether this candidate currently appears as the holder
    pub async fn is_held_by_us(&self) -> Result<bool> {
        Ok(self.current_holder().await?.as_deref() == Some(self.id.as_str()))
    }
}
