//! Coordination primitives for Haybale
//!
//! Thin layer over Redis used for three things: the directory leader lease,
//! the replication manager's advisory lock, and the blob byte cache. All of
//! them depend only on atomic create-if-absent, compare-and-delete and TTLs;
//! correctness never depends on cache contents. The [`CoordBackend`] trait
//! keeps the lease and lock state machines testable without a server.

pub mod backend;
pub mod cache;
pub mod lease;
pub mod lock;

pub use backend::{CoordBackend, MemoryBackend, RedisBackend};
pub use cache::BlobCache;
pub use lease::LeaderLease;
pub use lock::AdvisoryLock;

/// Key of the directory leader lease
pub const LEADER_KEY: &str = "directory/leader";

/// Key of the replication manager advisory lock
pub const REPLICATION_LOCK_KEY: &str = "replication/lock";
