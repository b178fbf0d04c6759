//! File-based response store with persisted metadata
//!
//! Bodies live under `<cache_dir>/<category>/<sha256(url)>`; all metadata is
//! kept in memory and mirrored to `<cache_dir>/index.json` so the cache
//! survives restarts.

use crate::error::Result;
use crate::pins::entry_identifier;
use crate::types::{CacheEntry, CacheStats, Category, Usage};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index.json";

/// Everything needed to store one response body
#[derive(Debug, Clone)]
pub struct StoreRequest<'a> {
    pub url: &'a str,
    pub resource_key: Option<&'a str>,
    pub category: Category,
    pub content_type: &'a str,
    pub protected: bool,
}

pub struct ProxyStore {
    /// Metadata keyed by URL
    entries: RwLock<HashMap<String, CacheEntry>>,
    cache_dir: PathBuf,
    hits: AtomicU64,
    misses: AtomicU64,
    /// Access data changed since the index was last written
    dirty: AtomicBool,
}

impl ProxyStore {
    /// Open the store, creating its directories and reloading the index.
    /// Index entries whose body file has gone missing are dropped.
    pub async fn open(cache_dir: PathBuf) -> Result<Self> {
        for category in Category::ALL {
            fs::create_dir_all(cache_dir.join(category.as_str())).await?;
        }

        let mut entries = HashMap::new();
        for entry in load_index(&cache_dir.join(INDEX_FILE)).await {
            if fs::try_exists(&entry.path).await.unwrap_or(false) {
                entries.insert(entry.url.clone(), entry);
            } else {
                warn!(url = %entry.url, "Dropping index entry without body");
            }
        }

        info!(cache_dir = ?cache_dir, entries = entries.len(), "Proxy store opened");
        Ok(Self {
            entries: RwLock::new(entries),
            cache_dir,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn file_name(url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn body_path(&self, category: Category, url: &str) -> PathBuf {
        self.cache_dir
            .join(category.as_str())
            .join(Self::file_name(url))
    }

    /// Read a cached body, recording the access
    pub async fn get(&self, url: &str) -> Option<(Vec<u8>, CacheEntry)> {
        let entry = self.entries.read().await.get(url).cloned();
        let Some(entry) = entry else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match fs::read(&entry.path).await {
            Ok(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let touched = self.touch(url).await.unwrap_or(entry);
                debug!(url, access_count = touched.access_count, "Store hit");
                Some((data, touched))
            }
            Err(e) => {
                warn!(url, error = %e, "Failed to read cached body, removing entry");
                self.remove(url).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn touch(&self, url: &str) -> Option<CacheEntry> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(url)?;
        entry.access_count += 1;
        entry.last_accessed = Utc::now();
        self.dirty.store(true, Ordering::Relaxed);
        Some(entry.clone())
    }

    pub async fn entry(&self, url: &str) -> Option<CacheEntry> {
        self.entries.read().await.get(url).cloned()
    }

    /// Write a body and its metadata. Replacing an entry resets its access
    /// statistics.
    pub async fn put(&self, request: StoreRequest<'_>, data: &[u8]) -> Result<CacheEntry> {
        let path = self.body_path(request.category, request.url);
        fs::write(&path, data).await?;

        let now = Utc::now();
        let entry = CacheEntry {
            url: request.url.to_string(),
            resource_key: request.resource_key.map(str::to_string),
            category: request.category,
            content_type: request.content_type.to_string(),
            size_bytes: data.len() as u64,
            cached_at: now,
            last_accessed: now,
            access_count: 0,
            protected: request.protected,
            path,
        };

        let previous = self
            .entries
            .write()
            .await
            .insert(entry.url.clone(), entry.clone());
        if let Some(previous) = previous {
            if previous.path != entry.path {
                remove_file(&previous.path).await;
            }
        }

        self.persist().await?;
        debug!(
            url = %entry.url,
            category = entry.category.as_str(),
            size = entry.size_bytes,
            "Stored response"
        );
        Ok(entry)
    }

    /// Remove an entry and its body; the index is persisted by the caller
    pub async fn remove(&self, url: &str) -> Option<CacheEntry> {
        let entry = self.entries.write().await.remove(url)?;
        remove_file(&entry.path).await;
        Some(entry)
    }

    /// Set the protected flag on every entry whose identifier matches
    pub async fn set_protected(&self, identifier: &str, protected: bool) -> Result<usize> {
        let mut changed = 0;
        {
            let mut entries = self.entries.write().await;
            for entry in entries.values_mut() {
                if entry.protected != protected
                    && entry_identifier(entry).as_deref() == Some(identifier)
                {
                    entry.protected = protected;
                    changed += 1;
                }
            }
        }

        if changed > 0 {
            self.persist().await?;
        }
        Ok(changed)
    }

    pub async fn snapshot(&self) -> Vec<CacheEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn usage(&self) -> Usage {
        let entries = self.entries.read().await;
        let mut usage = Usage::default();
        for entry in entries.values() {
            usage.total += entry.size_bytes;
            match entry.category {
                Category::Critical => usage.critical += entry.size_bytes,
                Category::Soundfont => {
                    usage.soundfont += entry.size_bytes;
                    usage.soundfont_count += 1;
                }
                Category::Generic => usage.generic += entry.size_bytes,
            }
        }
        usage
    }

    /// Remove every entry outside `keep`; returns the number removed
    pub async fn clear_except(&self, keep: Category) -> Result<usize> {
        let removed: Vec<CacheEntry> = {
            let mut entries = self.entries.write().await;
            let urls: Vec<String> = entries
                .values()
                .filter(|e| e.category != keep)
                .map(|e| e.url.clone())
                .collect();
            urls.iter().filter_map(|url| entries.remove(url)).collect()
        };

        for entry in &removed {
            remove_file(&entry.path).await;
        }
        self.persist().await?;
        Ok(removed.len())
    }

    pub async fn stats(&self) -> CacheStats {
        let usage = self.usage().await;
        let entries = self.entries.read().await;
        CacheStats {
            entries: entries.len(),
            total_size: usage.total,
            critical_size: usage.critical,
            soundfont_size: usage.soundfont,
            generic_size: usage.generic,
            soundfont_count: usage.soundfont_count,
            protected_count: entries.values().filter(|e| e.protected).count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Write the index if reads have changed access data since the last
    /// write; returns whether it was written
    pub async fn flush_access(&self) -> Result<bool> {
        if !self.dirty.load(Ordering::Relaxed) {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }

    /// Write the metadata index to disk
    pub async fn persist(&self) -> Result<()> {
        self.dirty.store(false, Ordering::Relaxed);
        let raw = {
            let entries = self.entries.read().await;
            let list: Vec<&CacheEntry> = entries.values().collect();
            serde_json::to_vec(&list)?
        };
        if let Err(e) = fs::write(self.cache_dir.join(INDEX_FILE), raw).await {
            self.dirty.store(true, Ordering::Relaxed);
            return Err(e.into());
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn set_access(
        &self,
        url: &str,
        access_count: u64,
        last_accessed: chrono::DateTime<Utc>,
    ) {
        if let Some(entry) = self.entries.write().await.get_mut(url) {
            entry.access_count = access_count;
            entry.last_accessed = last_accessed;
        }
    }
}

async fn load_index(path: &Path) -> Vec<CacheEntry> {
    match fs::read(path).await {
        Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
            warn!(path = ?path, error = %e, "Discarding corrupt proxy index");
            Vec::new()
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to read proxy index");
            Vec::new()
        }
    }
}

async fn remove_file(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = ?path, error = %e, "Failed to remove cached body");
        }
    }
}
