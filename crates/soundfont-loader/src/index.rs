//! Advisory metadata index: key to source URL, timestamps and access counts
//!
//! Never consulted for correctness; it can be rebuilt from tier contents at
//! any time.

use crate::error::TierError;
use crate::types::IndexEntry;
use chrono::Utc;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub struct MetadataIndex {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<String, IndexEntry>>,
}

impl MetadataIndex {
    /// Index that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Load the index from `path`; a missing or corrupt file yields an empty index
    pub async fn load(path: PathBuf) -> Self {
        let entries = match fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice::<HashMap<String, IndexEntry>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = ?path, error = %e, "Discarding corrupt metadata index");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read metadata index");
                HashMap::new()
            }
        };

        debug!(path = ?path, entries = entries.len(), "Metadata index loaded");
        Self {
            path: Some(path),
            entries: RwLock::new(entries),
        }
    }

    pub async fn record(&self, key: &str, source_url: Option<&str>, size_bytes: u64) {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert_with(|| IndexEntry {
            source_url: None,
            size_bytes,
            cached_at: now,
            last_accessed: now,
            access_count: 0,
        });
        if source_url.is_some() {
            entry.source_url = source_url.map(str::to_string);
        }
        entry.size_bytes = size_bytes;
        entry.cached_at = now;
    }

    pub async fn touch(&self, key: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(key) {
            entry.access_count += 1;
            entry.last_accessed = Utc::now();
        }
    }

    pub async fn get(&self, key: &str) -> Option<IndexEntry> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn remove(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Replace the index with what the tiers actually hold. Known source URLs
    /// and access counts are kept for keys that are still present.
    pub async fn rebuild(&self, present: Vec<(String, u64)>) {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let mut rebuilt = HashMap::with_capacity(present.len());

        for (key, size_bytes) in present {
            let entry = entries.remove(&key).unwrap_or(IndexEntry {
                source_url: None,
                size_bytes,
                cached_at: now,
                last_accessed: now,
                access_count: 0,
            });
            rebuilt.insert(key, IndexEntry { size_bytes, ..entry });
        }

        *entries = rebuilt;
    }

    /// Write the index to disk (no-op for in-memory indexes)
    pub async fn persist(&self) -> Result<(), TierError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = {
            let entries = self.entries.read().await;
            serde_json::to_vec(&*entries)?
        };
        fs::write(path, raw).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_record_and_touch() {
        let index = MetadataIndex::in_memory();
        index
            .record("bassoon", Some("https://a.example/bassoon.json"), 42)
            .await;
        index.touch("bassoon").await;
        index.touch("bassoon").await;
        index.touch("missing").await;

        let entry = index.get("bassoon").await.unwrap();
        assert_eq!(entry.access_count, 2);
        assert_eq!(entry.size_bytes, 42);
        assert_eq!(
            entry.source_url.as_deref(),
            Some("https://a.example/bassoon.json")
        );
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.json");

        let index = MetadataIndex::load(path.clone()).await;
        index.record("shamisen", None, 7).await;
        index.persist().await.unwrap();

        let reloaded = MetadataIndex::load(path).await;
        assert_eq!(reloaded.get("shamisen").await.unwrap().size_bytes, 7);
    }

    #[tokio::test]
    async fn test_corrupt_index_loads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let index = MetadataIndex::load(path).await;
        assert_eq!(index.len().await, 0);
    }

    #[tokio::test]
    async fn test_rebuild_keeps_known_sources() {
        let index = MetadataIndex::in_memory();
        index.record("kalimba", Some("https://a.example/k.json"), 1).await;
        index.record("gone", None, 1).await;

        index
            .rebuild(vec![("kalimba".to_string(), 9), ("new".to_string(), 3)])
            .await;

        assert_eq!(index.len().await, 2);
        assert!(index.get("gone").await.is_none());
        let kalimba = index.get("kalimba").await.unwrap();
        assert_eq!(kalimba.size_bytes, 9);
        assert_eq!(kalimba.source_url.as_deref(), Some("https://a.example/k.json"));
        assert!(index.get("new").await.unwrap().source_url.is_none());
    }
}
