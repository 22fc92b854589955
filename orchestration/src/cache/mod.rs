//! Per-file scan result cache
//!
//! Maps (repository, file path, tool, content hash, config hash) to the
//! findings a tool previously produced for that exact file content under
//! that exact tool configuration. Entries expire after a TTL and are
//! invalidated by path when files are deleted or renamed.

mod backend;

pub use backend::{CacheBackend, MemoryBackend};

#[cfg(feature = "redis-backend")]
pub use backend::RedisBackend;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::Finding;

/// Error type for cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Separator for storage-key components; not legal in any component
const KEY_SEP: char = '\u{1f}';

/// Five-tuple key identifying one cached result
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub repo: String,
    pub path: String,
    pub tool: String,
    /// SHA-256 of the file's content
    pub content_hash: String,
    /// Stable digest of the tool's configuration
    pub config_hash: String,
}

impl CacheKey {
    pub fn new(
        repo: impl Into<String>,
        path: impl Into<String>,
        tool: impl Into<String>,
        content_hash: impl Into<String>,
        config_hash: impl Into<String>,
    ) -> Self {
        Self {
            repo: repo.into(),
            path: path.into(),
            tool: tool.into(),
            content_hash: content_hash.into(),
            config_hash: config_hash.into(),
        }
    }

    /// Flat storage key; components joined so that path-level prefixes are
    /// expressible for invalidation.
    pub fn storage_key(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}{sep}{}",
            self.repo,
            self.path,
            self.tool,
            self.content_hash,
            self.config_hash,
            sep = KEY_SEP
        )
    }

    /// Prefix matching every entry for (repo, path) regardless of tool or
    /// hashes
    pub fn path_prefix(repo: &str, path: &str) -> String {
        format!("{repo}{sep}{path}{sep}", sep = KEY_SEP)
    }

    /// Prefix matching every entry for a repository
    pub fn repo_prefix(repo: &str) -> String {
        format!("{repo}{sep}", sep = KEY_SEP)
    }
}

/// One cached per-(file, tool) result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub findings: Vec<Finding>,
    pub tool_version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, findings: Vec<Finding>, tool_version: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key,
            findings,
            tool_version: tool_version.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Entry age relative to its last update
    pub fn age(&self) -> Duration {
        (Utc::now() - self.updated_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Aggregate cache statistics for a repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub approx_bytes: u64,
}

/// The result cache used by the planner and dispatcher.
///
/// All operations are individually atomic; `get`/`set` on the same key race
/// freely. An entry, once set, is observable until invalidated or expired.
pub struct ResultCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// In-memory cache with the given TTL; the default for tests and
    /// single-process deployments.
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a prior result. A hit requires all five key components to
    /// match and the entry to be younger than the TTL.
    pub async fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        let raw = self.backend.get(&key.storage_key()).await?;

        let entry = match raw {
            Some(bytes) => serde_json::from_slice::<CacheEntry>(&bytes)
                .map_err(|e| CacheError::Serialization(e.to_string()))?,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        if entry.age() > self.ttl {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.backend.delete(&key.storage_key()).await?;
            return Ok(None);
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry))
    }

    /// Store a result, replacing any entry under the same key.
    pub async fn set(&self, entry: CacheEntry) -> CacheResult<()> {
        let bytes = serde_json::to_vec(&entry)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.backend
            .put(&entry.key.storage_key(), bytes, self.ttl)
            .await
    }

    /// Drop every entry for the given paths in a repository. Entries for
    /// other paths are untouched.
    pub async fn invalidate(&self, repo: &str, paths: &[String]) -> CacheResult<u64> {
        let mut removed = 0;
        for path in paths {
            removed += self
                .backend
                .delete_prefix(&CacheKey::path_prefix(repo, path))
                .await?;
        }
        if removed > 0 {
            debug!(repo, removed, "invalidated cache entries");
        }
        Ok(removed)
    }

    /// Aggregate statistics for a repository plus process-lifetime hit/miss
    /// counters.
    pub async fn stats(&self, repo: &str) -> CacheResult<CacheStats> {
        let (entries, approx_bytes) = self
            .backend
            .prefix_stats(&CacheKey::repo_prefix(repo))
            .await?;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        Ok(CacheStats {
            entries,
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            approx_bytes,
        })
    }

    /// Remove entries older than `max_age` regardless of the configured TTL.
    pub async fn cleanup(&self, max_age: Duration) -> CacheResult<u64> {
        self.backend.purge_older_than(max_age).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, Severity};

    fn entry(path: &str, tool: &str, content_hash: &str) -> CacheEntry {
        let key = CacheKey::new("repo-1", path, tool, content_hash, "cfg-1");
        let finding = Finding::new(
            tool,
            "B602",
            Severity::High,
            Category::CommandInjection,
            "shell=True",
            path,
            25,
        );
        CacheEntry::new(key, vec![finding], "1.7.5")
    }

    fn cache() -> ResultCache {
        ResultCache::in_memory(Duration::from_secs(86_400))
    }

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let cache = cache();
        let e = entry("src/utils.py", "bandit", "aaa");

        cache.set(e.clone()).await.unwrap();
        let got = cache.get(&e.key).await.unwrap().expect("hit");
        assert_eq!(got.key, e.key);
        assert_eq!(got.findings.len(), 1);
        assert_eq!(got.tool_version, "1.7.5");
    }

    #[tokio::test]
    async fn test_get_misses_on_any_component_mismatch() {
        let cache = cache();
        let e = entry("src/utils.py", "bandit", "aaa");
        cache.set(e.clone()).await.unwrap();

        let mut other = e.key.clone();
        other.content_hash = "bbb".into();
        assert!(cache.get(&other).await.unwrap().is_none());

        let mut other = e.key.clone();
        other.config_hash = "cfg-2".into();
        assert!(cache.get(&other).await.unwrap().is_none());

        let mut other = e.key.clone();
        other.tool = "semgrep".into();
        assert!(cache.get(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_is_path_scoped() {
        let cache = cache();
        let a = entry("src/a.py", "bandit", "aaa");
        let a2 = entry("src/a.py", "semgrep", "aaa");
        let b = entry("src/b.py", "bandit", "bbb");
        cache.set(a.clone()).await.unwrap();
        cache.set(a2.clone()).await.unwrap();
        cache.set(b.clone()).await.unwrap();

        let removed = cache
            .invalidate("repo-1", &["src/a.py".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);

        assert!(cache.get(&a.key).await.unwrap().is_none());
        assert!(cache.get(&a2.key).await.unwrap().is_none());
        assert!(cache.get(&b.key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = ResultCache::in_memory(Duration::ZERO);
        let e = entry("src/utils.py", "bandit", "aaa");
        cache.set(e.clone()).await.unwrap();

        // TTL of zero: every entry is already expired.
        assert!(cache.get(&e.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_counts_entries_and_lookups() {
        let cache = cache();
        let e = entry("src/utils.py", "bandit", "aaa");
        cache.set(e.clone()).await.unwrap();

        cache.get(&e.key).await.unwrap();
        let mut miss_key = e.key.clone();
        miss_key.path = "src/other.py".into();
        cache.get(&miss_key).await.unwrap();

        let stats = cache.stats("repo-1").await.unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
        assert!(stats.approx_bytes > 0);
    }

    #[tokio::test]
    async fn test_set_replaces_same_key() {
        let cache = cache();
        let mut e = entry("src/utils.py", "bandit", "aaa");
        cache.set(e.clone()).await.unwrap();

        e.tool_version = "1.8.0".into();
        cache.set(e.clone()).await.unwrap();

        let got = cache.get(&e.key).await.unwrap().unwrap();
        assert_eq!(got.tool_version, "1.8.0");
    }
}
