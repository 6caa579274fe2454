//! Core type definitions for Haybale
//!
//! Identifiers, store descriptors and the directory metadata record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a stored blob
///
/// Allocated monotonically by the directory leader. The numeric value is
/// meaningful only as a key; clients treat it as opaque.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhotoId(u64);

impl PhotoId {
    /// Create from a raw u64
    #[must_use]
    pub const fn from_u64(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw u64 value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Big-endian byte representation (used in the needle header)
    #[must_use]
    pub const fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Reconstruct from big-endian bytes
    #[must_use]
    pub const fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Debug for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhotoId({})", self.0)
    }
}

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PhotoId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for a store node
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreId(Uuid);

impl StoreId {
    /// Generate a new random store ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for StoreId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreId({})", self.0)
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StoreId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Health state of a store as tracked by the directory
///
/// Transitions are driven by heartbeat silence: Healthy -> Suspect at half
/// the health window, Suspect -> Down at the full window. Down stores are
/// excluded from placement and locate results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreStatus {
    /// Heartbeating within the window
    #[default]
    Healthy,
    /// Heartbeat overdue; still serving but not placed on
    Suspect,
    /// Heartbeat silence exceeded the health window
    Down,
}

impl fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Suspect => write!(f, "suspect"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Store descriptor held by the directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    /// Store identity
    pub store_id: StoreId,
    /// HTTP address other components use to reach the store
    pub address: String,
    /// Current health status
    pub status: StoreStatus,
    /// Last heartbeat receipt, milliseconds since the Unix epoch
    pub last_heartbeat_ms: u64,
    /// Free disk bytes reported by the store
    pub free_bytes: u64,
    /// Total volume bytes on disk
    pub volume_bytes: u64,
    /// Bytes belonging to live (non-deleted, non-superseded) needles
    pub live_bytes: u64,
    /// Operations served in the trailing 60 seconds
    pub ops_60s: u64,
}

impl StoreDescriptor {
    /// Whether this store is a valid read/placement target
    #[must_use]
    pub fn is_healthy(&self, now_ms: u64, health_window_ms: u64) -> bool {
        self.status == StoreStatus::Healthy
            && now_ms.saturating_sub(self.last_heartbeat_ms) < health_window_ms
    }
}

/// Point-in-time statistics reported by a store
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Free disk bytes
    pub free_bytes: u64,
    /// Total bytes across all volume files
    pub volume_bytes: u64,
    /// Bytes belonging to live needles
    pub live_bytes: u64,
    /// Operations served in the trailing 60 seconds
    pub ops_60s: u64,
}

/// Directory metadata record for one blob
///
/// Exclusively mutated by the current directory leader; followers hold a
/// push-updated replica. `locations` is the authoritative replica set; a
/// deleted record may keep locations until GC drains them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRecord {
    /// Blob identity
    pub photo_id: PhotoId,
    /// Payload size in bytes
    pub size: u64,
    /// Hex-encoded SHA256 of the payload
    pub checksum: String,
    /// Stores currently holding a replica
    pub locations: BTreeSet<StoreId>,
    /// Target replica count for this blob
    pub desired_replicas: u32,
    /// Tombstone flag; GC drains locations afterwards
    pub deleted: bool,
    /// Last mutation time, milliseconds since the Unix epoch
    pub updated_at_ms: u64,
}

impl PhotoRecord {
    /// Create a fresh record with no locations yet
    #[must_use]
    pub fn new(
        photo_id: PhotoId,
        size: u64,
        checksum: String,
        desired_replicas: u32,
        now_ms: u64,
    ) -> Self {
        Self {
            photo_id,
            size,
            checksum,
            locations: BTreeSet::new(),
            desired_replicas,
            deleted: false,
            updated_at_ms: now_ms,
        }
    }

    /// Locations restricted to a healthy set
    #[must_use]
    pub fn healthy_locations(&self, healthy: &BTreeSet<StoreId>) -> BTreeSet<StoreId> {
        self.locations.intersection(healthy).copied().collect()
    }

    /// True when fewer healthy replicas exist than desired
    #[must_use]
    pub fn under_replicated(&self, healthy: &BTreeSet<StoreId>) -> bool {
        !self.deleted && (self.healthy_locations(healthy).len() as u32) < self.desired_replicas
    }

    /// True when more total replicas exist than desired
    #[must_use]
    pub fn over_replicated(&self) -> bool {
        !self.deleted && (self.locations.len() as u32) > self.desired_replicas
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
#[must_use]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
