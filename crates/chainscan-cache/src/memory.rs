//! In-process cache backend

use crate::{CacheStore, StoredEntry};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

struct MemoryEntry {
    value: Vec<u8>,
    stored_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Map-backed store; eviction and TTL semantics match the file backend
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), MemoryEntry>>,
    max_size_bytes: u64,
}

impl MemoryStore {
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_size_bytes,
        }
    }

    fn evict_if_needed(entries: &mut HashMap<(String, String), MemoryEntry>, budget: u64) {
        let mut total: u64 = entries.values().map(|e| e.value.len() as u64).sum();
        if total <= budget {
            return;
        }
        let mut by_access: Vec<((String, String), DateTime<Utc>, u64)> = entries
            .iter()
            .map(|(k, e)| (k.clone(), e.last_accessed, e.value.len() as u64))
            .collect();
        by_access.sort_by_key(|(_, accessed, _)| *accessed);
        for (key, _, size) in by_access {
            if total <= budget {
                break;
            }
            entries.remove(&key);
            total -= size;
        }
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredEntry>> {
        let mut entries = self.entries.lock().unwrap();
        let map_key = (namespace.to_string(), key.to_string());
        let expired = entries.get(&map_key).map(|e| e.is_expired()).unwrap_or(false);
        if expired {
            entries.remove(&map_key);
            return Ok(None);
        }
        if let Some(entry) = entries.get_mut(&map_key) {
            entry.last_accessed = Utc::now();
            return Ok(Some(StoredEntry {
                value: entry.value.clone(),
                stored_at: entry.stored_at,
            }));
        }
        Ok(None)
    }

    fn put(&self, namespace: &str, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()> {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            (namespace.to_string(), key.to_string()),
            MemoryEntry {
                value,
                stored_at: now,
                expires_at: now + chrono::Duration::seconds(ttl_secs as i64),
                last_accessed: now,
            },
        );
        Self::evict_if_needed(&mut entries, self.max_size_bytes);
        Ok(())
    }

    fn invalidate(&self, namespace: &str, key: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    fn purge_namespace(&self, namespace: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .retain(|(ns, _), _| ns != namespace);
        Ok(())
    }

    fn sweep_expired(&self) -> Result<usize> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired());
        Ok(before - entries.len())
    }

    fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn size_bytes(&self) -> u64 {
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(|e| e.value.len() as u64)
            .sum()
    }
}
