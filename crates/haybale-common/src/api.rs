//! Wire types for the HTTP interfaces
//!
//! Request and response bodies shared by the services and their clients.
//! Unknown fields are rejected on deserialization so schema drift surfaces
//! as an error instead of silent truncation.

use crate::types::{PhotoId, PhotoRecord, StoreDescriptor, StoreId, StoreStats};
use serde::{Deserialize, Serialize};

/// Name of the header carrying the uploader's SHA256 hex digest
pub const CHECKSUM_HEADER: &str = "x-haybale-checksum";

/// A store address pair returned by locate/register
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreLocation {
    /// Store identity
    pub store_id: StoreId,
    /// HTTP base address of the store
    pub address: String,
}

/// `POST /register` request body
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    /// Payload size in bytes
    pub size: u64,
    /// Hex-encoded SHA256 of the payload
    pub checksum: String,
}

/// `POST /register` response body
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterResponse {
    /// Newly allocated id
    pub photo_id: PhotoId,
    /// Stores the client should write to
    pub locations: Vec<StoreLocation>,
}

/// `POST /commit` request body
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommitRequest {
    /// Blob the commit applies to
    pub photo_id: PhotoId,
    /// Stores that acknowledged the write
    pub locations: Vec<StoreId>,
}

/// `GET /locate` response body
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocateResponse {
    /// Healthy stores currently holding the blob
    pub locations: Vec<StoreLocation>,
}

/// `GET /status` response body (directory view of one blob)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhotoStatusResponse {
    /// The full metadata record
    pub record: PhotoRecord,
    /// Addresses of the healthy locations
    pub healthy_locations: Vec<StoreLocation>,
}

/// `POST /sync` request body: a pushed metadata delta
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncRequest {
    /// Records in this delta
    pub records: Vec<PhotoRecord>,
}

/// `GET /changes` response body
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangesResponse {
    /// Records mutated after the requested watermark
    pub records: Vec<PhotoRecord>,
    /// Leader clock when the response was built; the next poll's watermark
    pub now_ms: u64,
}

/// Scan selection for the replication manager
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Under- and over-replicated records only, under-replicated first
    Priority,
    /// Every record; used by the nightly audit
    Full,
}

/// One record in a scan response
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanRecord {
    /// The metadata record
    pub record: PhotoRecord,
    /// Whether the blob's 60 s read rate exceeds the hotness threshold
    pub hot: bool,
}

/// `GET /scan` response body
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanResponse {
    /// Selected records
    pub records: Vec<ScanRecord>,
}

/// `GET /stores` response body
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoresResponse {
    /// Every known store descriptor
    pub stores: Vec<StoreDescriptor>,
}

/// `GET /stats` response body of a store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    /// Store identity
    pub store_id: StoreId,
    /// Current counters
    #[serde(flatten)]
    pub stats: StoreStats,
}

/// `POST /set_desired` request body
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetDesiredRequest {
    /// Blob to adjust
    pub photo_id: PhotoId,
    /// New target replica count
    pub desired_replicas: u32,
}

/// `GET /photos_on_store` response body
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhotosOnStoreResponse {
    /// Non-deleted photos the directory places on the queried store
    pub photo_ids: Vec<u64>,
}

/// Error body returned by every service
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable error description
    pub error: String,
    /// Current leader address, set on not-leader rejections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
}
