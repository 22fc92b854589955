//! Cache backing stores
//!
//! The backend contract is deliberately small: read, write with TTL, delete
//! by key, delete by prefix, plus the aggregate scans stats and cleanup
//! need. A process-local map and a Redis-class store are interchangeable
//! behind it, so the test suite runs without external services.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::CacheResult;

#[cfg(feature = "redis-backend")]
use super::CacheError;

/// Storage contract for the result cache
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Delete every key starting with `prefix`; returns how many were
    /// removed
    async fn delete_prefix(&self, prefix: &str) -> CacheResult<u64>;

    /// (entry count, approximate byte size) for keys under `prefix`
    async fn prefix_stats(&self, prefix: &str) -> CacheResult<(u64, u64)>;

    /// Remove entries written longer than `max_age` ago
    async fn purge_older_than(&self, max_age: Duration) -> CacheResult<u64>;
}

struct Stored {
    value: Vec<u8>,
    written_at: Instant,
    expires_at: Instant,
}

/// Process-local backend over a sorted map.
///
/// BTreeMap keeps keys ordered, so prefix operations are range scans.
/// Expiry is enforced lazily on read and eagerly by `purge_older_than`.
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Stored>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(stored) if stored.expires_at > Instant::now() => {
                Ok(Some(stored.value.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Stored {
                value,
                written_at: now,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> CacheResult<u64> {
        let mut entries = self.entries.write().await;
        let doomed: Vec<String> = entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        let count = doomed.len() as u64;
        for key in doomed {
            entries.remove(&key);
        }
        Ok(count)
    }

    async fn prefix_stats(&self, prefix: &str) -> CacheResult<(u64, u64)> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut count = 0u64;
        let mut bytes = 0u64;
        for (key, stored) in entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            if stored.expires_at > now {
                count += 1;
                bytes += (key.len() + stored.value.len()) as u64;
            }
        }
        Ok((count, bytes))
    }

    async fn purge_older_than(&self, max_age: Duration) -> CacheResult<u64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(_, s)| {
                s.expires_at <= now || now.duration_since(s.written_at) > max_age
            })
            .map(|(k, _)| k.clone())
            .collect();
        let count = doomed.len() as u64;
        for key in doomed {
            entries.remove(&key);
        }
        Ok(count)
    }
}

/// Redis-backed store for multi-process deployments.
///
/// Expiry rides on Redis key TTLs; prefix operations use SCAN with a MATCH
/// pattern, so prefixes must not contain glob metacharacters (the cache's
/// unit-separator key layout guarantees this for its own keys).
#[cfg(feature = "redis-backend")]
pub struct RedisBackend {
    manager: redis::aio::ConnectionManager,
}

#[cfg(feature = "redis-backend")]
impl RedisBackend {
    pub async fn connect(url: &str) -> CacheResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| CacheError::Backend(e.to_string()))?;
        let manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(Self { manager })
    }

    async fn scan_keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let mut cursor = 0u64;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}

#[cfg(feature = "redis-backend")]
#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn delete_prefix(&self, prefix: &str) -> CacheResult<u64> {
        let keys = self.scan_keys(&format!("{prefix}*")).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        let removed: u64 = redis::cmd("DEL")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(removed)
    }

    async fn prefix_stats(&self, prefix: &str) -> CacheResult<(u64, u64)> {
        let keys = self.scan_keys(&format!("{prefix}*")).await?;
        let mut conn = self.manager.clone();
        let mut bytes = 0u64;
        for key in &keys {
            let len: u64 = redis::cmd("STRLEN")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::Backend(e.to_string()))?;
            bytes += len + key.len() as u64;
        }
        Ok((keys.len() as u64, bytes))
    }

    async fn purge_older_than(&self, _max_age: Duration) -> CacheResult<u64> {
        // Redis expires entries via per-key TTLs; nothing to do here.
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        backend
            .put("k1", b"v1".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(backend.get("k1").await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(backend.get("k2").await.unwrap(), None);

        backend.delete("k1").await.unwrap();
        assert_eq!(backend.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_backend_prefix_delete() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);
        backend.put("a/1", b"x".to_vec(), ttl).await.unwrap();
        backend.put("a/2", b"y".to_vec(), ttl).await.unwrap();
        backend.put("b/1", b"z".to_vec(), ttl).await.unwrap();

        let removed = backend.delete_prefix("a/").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(backend.get("a/1").await.unwrap(), None);
        assert_eq!(backend.get("b/1").await.unwrap(), Some(b"z".to_vec()));
    }

    #[tokio::test]
    async fn test_memory_backend_expiry() {
        let backend = MemoryBackend::new();
        backend
            .put("k", b"v".to_vec(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(backend.get("k").await.unwrap(), None);

        let purged = backend.purge_older_than(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn test_memory_backend_prefix_stats_skip_expired() {
        let backend = MemoryBackend::new();
        backend
            .put("p/live", b"abc".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        backend
            .put("p/dead", b"abc".to_vec(), Duration::ZERO)
            .await
            .unwrap();

        let (count, bytes) = backend.prefix_stats("p/").await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(bytes, ("p/live".len() + 3) as u64);
    }
}
