//! File-backed cache store
//!
//! One subdirectory per namespace; values live in content files named by
//! the sha-256 of their key, and an `index.json` carries the bookkeeping.
//! Value writes go to a sibling temporary file and are renamed into place,
//! so readers observe either the old value or the new one, never a partial
//! file. On platforms where rename-over-existing is not permitted the
//! destination is removed first, leaving a brief window where a concurrent
//! reader sees a miss.

use crate::{CacheStore, StoredEntry};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    file_name: String,
    stored_at: DateTime<Utc>,
    ttl_secs: u64,
    last_accessed: DateTime<Utc>,
    size_bytes: u64,
}

impl FileEntry {
    fn is_expired(&self) -> bool {
        Utc::now() > self.stored_at + chrono::Duration::seconds(self.ttl_secs as i64)
    }
}

type Index = HashMap<String, FileEntry>;

pub struct FileStore {
    root: PathBuf,
    index: Mutex<Index>,
    max_size_bytes: u64,
}

impl FileStore {
    pub fn open(root: PathBuf, max_size_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache dir {}", root.display()))?;
        let index_path = root.join("index.json");
        let index = if index_path.exists() {
            let content = std::fs::read_to_string(&index_path)
                .with_context(|| format!("failed to read {}", index_path.display()))?;
            serde_json::from_str(&content).unwrap_or_default()
        } else {
            Index::new()
        };
        Ok(Self {
            root,
            index: Mutex::new(index),
            max_size_bytes,
        })
    }

    fn index_key(namespace: &str, key: &str) -> String {
        format!("{namespace}\u{0}{key}")
    }

    fn content_file_name(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        format!("{}.bin", hex::encode(hasher.finalize()))
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    fn save_index(&self, index: &Index) -> Result<()> {
        let content = serde_json::to_vec(index).context("failed to serialise cache index")?;
        atomic_write(&self.root.join("index.json"), &content)
    }

    fn remove_entry_file(&self, namespace: &str, entry: &FileEntry) {
        let _ = std::fs::remove_file(self.namespace_dir(namespace).join(&entry.file_name));
    }

    fn evict_if_needed(&self, index: &mut Index) {
        let mut total: u64 = index.values().map(|e| e.size_bytes).sum();
        if total <= self.max_size_bytes {
            return;
        }
        let mut by_access: Vec<(String, DateTime<Utc>, u64)> = index
            .iter()
            .map(|(k, e)| (k.clone(), e.last_accessed, e.size_bytes))
            .collect();
        by_access.sort_by_key(|(_, accessed, _)| *accessed);
        for (key, _, size) in by_access {
            if total <= self.max_size_bytes {
                break;
            }
            if let Some(entry) = index.remove(&key) {
                let namespace = key.split('\u{0}').next().unwrap_or_default().to_string();
                self.remove_entry_file(&namespace, &entry);
                total -= size;
            }
        }
    }
}

impl CacheStore for FileStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredEntry>> {
        let ikey = Self::index_key(namespace, key);
        let mut index = self.index.lock().unwrap();

        let expired = index.get(&ikey).map(|e| e.is_expired()).unwrap_or(false);
        if expired {
            if let Some(entry) = index.remove(&ikey) {
                self.remove_entry_file(namespace, &entry);
            }
            self.save_index(&index)?;
            return Ok(None);
        }

        let Some(entry) = index.get_mut(&ikey) else {
            return Ok(None);
        };
        entry.last_accessed = Utc::now();
        let stored_at = entry.stored_at;
        let path = self.namespace_dir(namespace).join(&entry.file_name);
        drop(index);

        match std::fs::read(&path) {
            Ok(value) => Ok(Some(StoredEntry { value, stored_at })),
            // Index and content can briefly disagree under concurrent
            // replacement; treat as a miss.
            Err(_) => Ok(None),
        }
    }

    fn put(&self, namespace: &str, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()> {
        let dir = self.namespace_dir(namespace);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let file_name = Self::content_file_name(key);
        atomic_write(&dir.join(&file_name), &value)?;

        let now = Utc::now();
        let mut index = self.index.lock().unwrap();
        index.insert(
            Self::index_key(namespace, key),
            FileEntry {
                file_name,
                stored_at: now,
                ttl_secs,
                last_accessed: now,
                size_bytes: value.len() as u64,
            },
        );
        self.evict_if_needed(&mut index);
        self.save_index(&index)
    }

    fn invalidate(&self, namespace: &str, key: &str) -> Result<()> {
        let mut index = self.index.lock().unwrap();
        if let Some(entry) = index.remove(&Self::index_key(namespace, key)) {
            self.remove_entry_file(namespace, &entry);
            self.save_index(&index)?;
        }
        Ok(())
    }

    fn purge_namespace(&self, namespace: &str) -> Result<()> {
        let mut index = self.index.lock().unwrap();
        let prefix = format!("{namespace}\u{0}");
        index.retain(|k, _| !k.starts_with(&prefix));
        let _ = std::fs::remove_dir_all(self.namespace_dir(namespace));
        self.save_index(&index)
    }

    fn sweep_expired(&self) -> Result<usize> {
        let mut index = self.index.lock().unwrap();
        let expired: Vec<String> = index
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = index.remove(key) {
                let namespace = key.split('\u{0}').next().unwrap_or_default().to_string();
                self.remove_entry_file(&namespace, &entry);
            }
        }
        self.save_index(&index)?;
        Ok(expired.len())
    }

    fn entry_count(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    fn size_bytes(&self) -> u64 {
        self.index.lock().unwrap().values().map(|e| e.size_bytes).sum()
    }
}

/// Write to a sibling temp file, then rename into place.
fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!(
        "tmp.{}.{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    std::fs::write(&tmp, content)
        .with_context(|| format!("failed to write {}", tmp.display()))?;

    #[cfg(windows)]
    {
        // Rename over an existing file is not permitted here; accept the
        // brief miss window between remove and rename.
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
    }

    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move cache entry into {}", path.display()))?;
    Ok(())
}
