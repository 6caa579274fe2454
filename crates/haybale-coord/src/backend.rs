//! Coordination store backends
//!
//! The production backend talks to Redis through a shared connection
//! manager. The in-memory backend exists for tests of the lease and lock
//! state machines.

use async_trait::async_trait;
use haybale_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Atomic key-value primitives the coordination layer needs
#[async_trait]
pub trait CoordBackend: Send + Sync {
    /// Create-if-absent with TTL; true when the key was created
    async fn acquire(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool>;

    /// Extend the TTL only while the key still holds `value`
    async fn refresh_if_value(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool>;

    /// Delete only while the key still holds `value`
    async fn release_if_value(&self, key: &str, value: &str) -> Result<bool>;

    /// Read the current string value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Read opaque bytes (cache entries)
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write opaque bytes with TTL (cache entries)
    async fn set_bytes(&self, key: &str, value: &[u8], ttl_ms: u64) -> Result<()>;

    /// Unconditional delete
    async fn del(&self, key: &str) -> Result<()>;
}

/// Redis-backed coordination store
pub struct RedisBackend {
    conn: redis::aio::ConnectionManager,
}

impl RedisBackend {
    /// Connect to the Redis server at `url`
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(to_coord_err)?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(to_coord_err)?;
        Ok(Self { conn })
    }
}

fn to_coord_err(err: redis::RedisError) -> Error {
    Error::Coordination(err.to_string())
}

const REFRESH_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

#[async_trait]
impl CoordBackend for RedisBackend {
    async fn acquire(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let opts = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::PX(ttl_ms as usize));
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg(&opts)
            .query_async(&mut conn)
            .await
            .map_err(to_coord_err)?;
        Ok(reply.is_some())
    }

    async fn refresh_if_value(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = redis::Script::new(REFRESH_SCRIPT)
            .key(key)
            .arg(value)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(to_coord_err)?;
        Ok(extended == 1)
    }

    async fn release_if_value(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(to_coord_err)?;
        Ok(deleted == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::AsyncCommands::get(&mut conn, key)
            .await
            .map_err(to_coord_err)
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        redis::AsyncCommands::get(&mut conn, key)
            .await
            .map_err(to_coord_err)
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl_ms: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(to_coord_err)?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::AsyncCommands::del(&mut conn, key)
            .await
            .map_err(to_coord_err)?;
        Ok(())
    }
}

/// In-memory backend for lease and lock tests
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl MemoryBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Force-expire a key, simulating TTL lapse
    pub fn expire_now(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    fn live_value(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl CoordBackend for MemoryBackend {
    async fn acquire(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        if self.live_value(key).is_some() {
            return Ok(false);
        }
        self.entries.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.as_bytes().to_vec(),
                expires_at: Instant::now() + Duration::from_millis(ttl_ms),
            },
        );
        Ok(true)
    }

    async fn refresh_if_value(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        if self.live_value(key).as_deref() != Some(value.as_bytes()) {
            return Ok(false);
        }
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.expires_at = Instant::now() + Duration::from_millis(ttl_ms);
            return Ok(true);
        }
        Ok(false)
    }

    async fn release_if_value(&self, key: &str, value: &str) -> Result<bool> {
        if self.live_value(key).as_deref() != Some(value.as_bytes()) {
            return Ok(false);
        }
        self.entries.lock().remove(key);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .live_value(key)
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.live_value(key))
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl_ms: u64) -> Result<()> {
        self.entries.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_vec(),
                expires_at: Instant::now() + Duration::from_millis(ttl_ms),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_acquire_is_exclusive() {
        let backend = MemoryBackend::new();
        assert!(backend.acquire("k", "a", 10_000).await.unwrap());
        assert!(!backend.acquire("k", "b", 10_000).await.unwrap());

        backend.expire_now("k");
        assert!(backend.acquire("k", "b", 10_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_refresh_requires_matching_value() {
        let backend = MemoryBackend::new();
        backend.acquire("k", "a", 10_000).await.unwrap();
        assert!(backend.refresh_if_value("k", "a", 10_000).await.unwrap());
        assert!(!backend.refresh_if_value("k", "b", 10_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_release_requires_matching_value() {
        let backend = MemoryBackend::new();
        backend.acquire("k", "a", 10_000).await.unwrap();
        assert!(!backend.release_if_value("k", "b").await.unwrap());
        assert!(backend.release_if_value("k", "a").await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), None);
    }
}
