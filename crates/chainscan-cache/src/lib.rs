//! Analysis cache
//!
//! Namespaced key–value store backing every external lookup the engine
//! makes: `llm`, `reputation`, `registry-metadata`, `osv`, `malicious-db`.
//! Keys are deterministic content hashes. TTL is enforced on read, not only
//! by sweeps; a configured byte budget is enforced by approximate-LRU
//! eviction. Backends are pluggable behind `CacheStore`.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// A stored value plus its bookkeeping
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub value: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

impl StoredEntry {
    pub fn age(&self) -> Duration {
        Utc::now() - self.stored_at
    }
}

/// Backend contract. All operations are namespace-scoped; `get` must apply
/// TTL itself so expiry does not depend on a background sweep.
pub trait CacheStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredEntry>>;
    fn put(&self, namespace: &str, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()>;
    fn invalidate(&self, namespace: &str, key: &str) -> Result<()>;
    fn purge_namespace(&self, namespace: &str) -> Result<()>;
    /// Remove expired entries; returns how many were dropped
    fn sweep_expired(&self) -> Result<usize>;
    fn entry_count(&self) -> usize;
    fn size_bytes(&self) -> u64;
}

/// Counters surfaced through `stats()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub size_bytes: u64,
}

/// The cache facade the rest of the system uses: typed JSON values over a
/// byte-oriented backend, with hit/miss accounting.
pub struct AnalysisCache {
    store: Box<dyn CacheStore>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AnalysisCache {
    pub fn new(store: Box<dyn CacheStore>) -> Self {
        Self {
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Deterministic, collision-resistant key from identifying parts
    pub fn hash_key(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    pub fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<(T, Duration)> {
        match self.store.get(namespace, key) {
            Ok(Some(entry)) => match serde_json::from_slice(&entry.value) {
                Ok(value) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some((value, entry.age()))
                }
                Err(e) => {
                    tracing::warn!(namespace, "discarding undecodable cache entry: {e}");
                    let _ = self.store.invalidate(namespace, key);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                tracing::warn!(namespace, "cache read failed: {e}");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put<T: Serialize>(&self, namespace: &str, key: &str, value: &T, ttl_secs: u64) {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                if let Err(e) = self.store.put(namespace, key, bytes, ttl_secs) {
                    tracing::warn!(namespace, "cache write failed: {e}");
                }
            }
            Err(e) => tracing::warn!(namespace, "cache value not serialisable: {e}"),
        }
    }

    pub fn invalidate(&self, namespace: &str, key: &str) -> Result<()> {
        self.store.invalidate(namespace, key)
    }

    pub fn purge_namespace(&self, namespace: &str) -> Result<()> {
        self.store.purge_namespace(namespace)
    }

    pub fn sweep_expired(&self) -> Result<usize> {
        self.store.sweep_expired()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.store.entry_count(),
            size_bytes: self.store.size_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_cache() -> AnalysisCache {
        AnalysisCache::new(Box::new(MemoryStore::new(1024 * 1024)))
    }

    #[test]
    fn test_put_get_round_trip() {
        let cache = memory_cache();
        cache.put("osv", "k1", &vec!["a".to_string(), "b".to_string()], 60);
        let (value, age) = cache.get::<Vec<String>>("osv", "k1").unwrap();
        assert_eq!(value, vec!["a".to_string(), "b".to_string()]);
        assert!(age.num_seconds() < 5);
    }

    #[test]
    fn test_invalidate_then_miss() {
        let cache = memory_cache();
        cache.put("osv", "k1", &1u32, 60);
        cache.invalidate("osv", "k1").unwrap();
        assert!(cache.get::<u32>("osv", "k1").is_none());
    }

    #[test]
    fn test_namespaces_are_disjoint() {
        let cache = memory_cache();
        cache.put("osv", "k", &1u32, 60);
        cache.put("reputation", "k", &2u32, 60);
        assert_eq!(cache.get::<u32>("osv", "k").unwrap().0, 1);
        assert_eq!(cache.get::<u32>("reputation", "k").unwrap().0, 2);
        cache.purge_namespace("osv").unwrap();
        assert!(cache.get::<u32>("osv", "k").is_none());
        assert_eq!(cache.get::<u32>("reputation", "k").unwrap().0, 2);
    }

    #[test]
    fn test_stats_counters() {
        let cache = memory_cache();
        cache.put("osv", "k", &1u32, 60);
        let _ = cache.get::<u32>("osv", "k");
        let _ = cache.get::<u32>("osv", "absent");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert!(stats.size_bytes > 0);
    }

    #[test]
    fn test_hash_key_deterministic_and_distinct() {
        let a = AnalysisCache::hash_key(&["npm", "lodash", "4.17.21"]);
        let b = AnalysisCache::hash_key(&["npm", "lodash", "4.17.21"]);
        let c = AnalysisCache::hash_key(&["npm", "lodash", "4.17.20"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
