//! Configuration types for Haybale
//!
//! Each daemon loads a TOML file and merges CLI flags over it (CLI takes
//! precedence). Defaults here are the recognized option defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Store daemon configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Listen address for the store HTTP service
    #[serde(default = "default_store_listen")]
    pub listen: String,
    /// Address advertised to the directory; derived from listen when unset
    #[serde(default)]
    pub advertise_addr: Option<String>,
    /// Directory addresses to heartbeat to
    #[serde(default)]
    pub directories: Vec<String>,
    /// Directory holding volume files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Seal the active volume at this size
    #[serde(default = "default_max_volume_size")]
    pub max_volume_size: u64,
    /// Disk capacity budget for this store
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,
    /// Live fraction below which a sealed volume is compacted
    #[serde(default = "default_compaction_efficiency_threshold")]
    pub compaction_efficiency_threshold: f64,
    /// Heartbeat period in seconds
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Compaction scan period in seconds
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,
    /// GC scan period in seconds
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
    /// Needles younger than this are never GC'd, so lagging followers do not
    /// cause data loss
    #[serde(default = "default_gc_grace_secs")]
    pub gc_grace_secs: u64,
    /// Free-space floor; puts fail with StoreFull below this
    #[serde(default = "default_free_bytes_floor")]
    pub free_bytes_floor: u64,
    /// Rate limit: sustained write requests per second per source address
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,
    /// Rate limit: burst capacity per source address
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
    /// Coordination / cache settings
    #[serde(default)]
    pub coord: CoordConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults are complete")
    }
}

/// Directory daemon configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Listen address for the directory HTTP service
    #[serde(default = "default_directory_listen")]
    pub listen: String,
    /// Address advertised as leader; derived from listen when unset
    #[serde(default)]
    pub advertise_addr: Option<String>,
    /// Peer directory addresses (followers to push to, leader to poll)
    #[serde(default)]
    pub peers: Vec<String>,
    /// Path of the redb metadata database
    #[serde(default = "default_meta_path")]
    pub meta_path: PathBuf,
    /// Leader lease TTL in seconds (T_lease)
    #[serde(default = "default_leader_timeout_secs")]
    pub leader_timeout_secs: u64,
    /// Follower anti-entropy poll period in seconds
    #[serde(default = "default_follower_sync_interval_secs")]
    pub follower_sync_interval_secs: u64,
    /// Heartbeat silence window in seconds; Suspect at half, Down at full
    #[serde(default = "default_health_window_secs")]
    pub health_window_secs: u64,
    /// Replica count assigned to new blobs
    #[serde(default = "default_default_replica_count")]
    pub default_replica_count: u32,
    /// Ceiling for hot-blob up-replication
    #[serde(default = "default_max_replica_count")]
    pub max_replica_count: u32,
    /// Extra free bytes a store must have beyond the blob size to be placed on
    #[serde(default = "default_placement_margin_bytes")]
    pub placement_margin_bytes: u64,
    /// Reads per 60 s above which a blob is considered hot
    #[serde(default = "default_hotness_threshold")]
    pub hotness_threshold: u64,
    /// Records returned per priority scan
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,
    /// Coordination settings
    #[serde(default)]
    pub coord: CoordConfig,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults are complete")
    }
}

/// Replication manager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Directory addresses (any replica; leader discovered via redirects)
    #[serde(default)]
    pub directories: Vec<String>,
    /// Control loop period in seconds
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Advisory lock TTL in seconds (T_replock)
    #[serde(default = "default_replock_ttl_secs")]
    pub replock_ttl_secs: u64,
    /// Hour of local time for the full audit
    #[serde(default = "default_nightly_audit_hour")]
    pub nightly_audit_hour: u32,
    /// Parallel copy jobs per tick
    #[serde(default = "default_copy_workers")]
    pub copy_workers: usize,
    /// Records examined per priority tick
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,
    /// Baseline replica count; must match the directory's setting
    #[serde(default = "default_default_replica_count")]
    pub default_replica_count: u32,
    /// Ceiling for hot-blob up-replication; must match the directory's
    #[serde(default = "default_max_replica_count")]
    pub max_replica_count: u32,
    /// Placement free-space margin; must match the directory's
    #[serde(default = "default_placement_margin_bytes")]
    pub placement_margin_bytes: u64,
    /// Coordination settings
    #[serde(default)]
    pub coord: CoordConfig,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults are complete")
    }
}

/// Shared coordination-store settings (Redis)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Cache entry TTL in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_store_listen() -> String {
    "0.0.0.0:7100".to_string()
}

fn default_directory_listen() -> String {
    "0.0.0.0:7200".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./store-data")
}

fn default_meta_path() -> PathBuf {
    PathBuf::from("./directory-meta.redb")
}

fn default_max_volume_size() -> u64 {
    8 * 1024 * 1024 * 1024 // 8 GB
}

fn default_capacity_bytes() -> u64 {
    64 * 1024 * 1024 * 1024 // 64 GB
}

fn default_compaction_efficiency_threshold() -> f64 {
    0.6
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_compaction_interval_secs() -> u64 {
    300
}

fn default_gc_interval_secs() -> u64 {
    600
}

fn default_gc_grace_secs() -> u64 {
    3600
}

fn default_free_bytes_floor() -> u64 {
    256 * 1024 * 1024 // 256 MB
}

fn default_rate_limit_per_sec() -> u32 {
    50
}

fn default_rate_limit_burst() -> u32 {
    100
}

fn default_leader_timeout_secs() -> u64 {
    10
}

fn default_follower_sync_interval_secs() -> u64 {
    30
}

fn default_health_window_secs() -> u64 {
    60
}

fn default_default_replica_count() -> u32 {
    3
}

fn default_max_replica_count() -> u32 {
    5
}

fn default_placement_margin_bytes() -> u64 {
    64 * 1024 * 1024 // 64 MB
}

fn default_hotness_threshold() -> u64 {
    100
}

fn default_tick_interval_secs() -> u64 {
    30
}

fn default_replock_ttl_secs() -> u64 {
    60
}

fn default_nightly_audit_hour() -> u32 {
    3
}

fn default_copy_workers() -> usize {
    4
}

fn default_scan_limit() -> usize {
    1024
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    24 * 3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse_from_empty_toml() {
        let cfg: StoreConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.heartbeat_interval_secs, 10);
        assert_eq!(cfg.rate_limit_burst, 100);

        let cfg: DirectoryConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.leader_timeout_secs, 10);
        assert_eq!(cfg.default_replica_count, 3);
        assert_eq!(cfg.max_replica_count, 5);

        let cfg: ReplicatorConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.tick_interval_secs, 30);
        assert_eq!(cfg.nightly_audit_hour, 3);
    }

    #[test]
    fn test_partial_override() {
        let cfg: DirectoryConfig = toml::from_str(
            r#"
            leader_timeout_secs = 5
            peers = ["http://10.0.0.2:7200"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.leader_timeout_secs, 5);
        assert_eq!(cfg.peers.len(), 1);
        assert_eq!(cfg.health_window_secs, 60);
    }
}
