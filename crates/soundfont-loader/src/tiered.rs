//! Tiered cache: memory → blob store → legacy store
//!
//! Lookups walk the tiers top-down and back-fill every tier above the one
//! that hit. Writes go to every tier; a failing tier is logged and skipped.

use crate::error::TierError;
use crate::index::MetadataIndex;
use crate::payload::Payload;
use crate::tiers::{MemoryTier, PersistentTier};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which tier served a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierLevel {
    Memory,
    /// Position among the persistent tiers (0 = first below memory)
    Persistent { depth: usize, name: &'static str },
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub payload: Payload,
    pub tier: TierLevel,
}

/// Outcome of a write-through
#[derive(Debug, Default)]
pub struct WriteReport {
    pub written: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
}

pub struct TieredCache {
    memory: MemoryTier,
    persistent: Vec<Arc<dyn PersistentTier>>,
    index: MetadataIndex,
}

impl TieredCache {
    /// `persistent` is ordered fastest/largest first
    pub fn new(
        memory: MemoryTier,
        persistent: Vec<Arc<dyn PersistentTier>>,
        index: MetadataIndex,
    ) -> Self {
        Self {
            memory,
            persistent,
            index,
        }
    }

    pub fn tier_names(&self) -> Vec<&'static str> {
        let mut names = vec!["memory"];
        names.extend(self.persistent.iter().map(|t| t.name()));
        names
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    pub async fn lookup(&self, key: &str) -> Option<CacheHit> {
        if let Some(payload) = self.memory.get(key).await {
            self.index.touch(key).await;
            debug!(key, tier = "memory", "Cache hit");
            return Some(CacheHit {
                payload,
                tier: TierLevel::Memory,
            });
        }

        for (depth, tier) in self.persistent.iter().enumerate() {
            let bytes = match tier.get(key).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key, tier = tier.name(), error = %e, "Tier read failed");
                    continue;
                }
            };

            let payload = match Payload::decode(key, bytes) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(key, tier = tier.name(), error = %e, "Dropping undecodable entry");
                    self.remove(key).await;
                    return None;
                }
            };

            self.memory.insert(payload.clone()).await;
            for upper in &self.persistent[..depth] {
                if let Err(e) = upper.put(key, payload.bytes()).await {
                    warn!(key, tier = upper.name(), error = %e, "Back-fill failed");
                }
            }
            self.index.touch(key).await;

            debug!(key, tier = tier.name(), "Cache hit");
            return Some(CacheHit {
                payload,
                tier: TierLevel::Persistent {
                    depth,
                    name: tier.name(),
                },
            });
        }

        debug!(key, "Cache miss");
        None
    }

    pub async fn write_through(
        &self,
        key: &str,
        payload: &Payload,
        source_url: Option<&str>,
    ) -> WriteReport {
        let mut report = WriteReport::default();

        self.memory.insert(payload.clone()).await;
        report.written.push("memory");

        for tier in &self.persistent {
            match tier.put(key, payload.bytes()).await {
                Ok(()) => report.written.push(tier.name()),
                Err(e) => {
                    warn!(key, tier = tier.name(), error = %e, "Tier write failed");
                    report.failed.push((tier.name(), e.to_string()));
                }
            }
        }

        self.index
            .record(key, source_url, payload.size_bytes())
            .await;
        if let Err(e) = self.index.persist().await {
            warn!(key, error = %e, "Failed to persist metadata index");
        }

        report
    }

    /// Drop `key` from every tier and the index
    pub async fn remove(&self, key: &str) {
        self.memory.remove(key).await;
        for tier in &self.persistent {
            if let Err(e) = tier.remove(key).await {
                warn!(key, tier = tier.name(), error = %e, "Tier remove failed");
            }
        }
        self.index.remove(key).await;
    }

    pub async fn clear(&self) -> Result<(), TierError> {
        self.memory.clear();
        for tier in &self.persistent {
            tier.clear().await?;
        }
        self.index.clear().await;
        self.index.persist().await
    }

    /// Rebuild the metadata index from persistent tier contents
    pub async fn rebuild_index(&self) -> Result<usize, TierError> {
        let mut present: Vec<(String, u64)> = Vec::new();
        for tier in &self.persistent {
            match tier.keys().await {
                Ok(keys) => {
                    for (key, size) in keys {
                        if !present.iter().any(|(k, _)| *k == key) {
                            present.push((key, size));
                        }
                    }
                }
                Err(e) => warn!(tier = tier.name(), error = %e, "Tier scan failed"),
            }
        }

        let count = present.len();
        self.index.rebuild(present).await;
        self.index.persist().await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::sample_document;
    use crate::tiers::{BlobStoreTier, LegacyTier};
    use std::path::Path;
    use tempfile::tempdir;

    async fn build(
        root: &Path,
        legacy_limit: u64,
    ) -> (TieredCache, Arc<BlobStoreTier>, Arc<LegacyTier>) {
        let blobs = Arc::new(BlobStoreTier::open(root.join("blobs")).await.unwrap());
        let legacy = Arc::new(
            LegacyTier::open(root.join("legacy"), legacy_limit)
                .await
                .unwrap(),
        );
        let tiers: Vec<Arc<dyn PersistentTier>> = vec![blobs.clone(), legacy.clone()];
        let cache = TieredCache::new(
            MemoryTier::new(1024 * 1024),
            tiers,
            MetadataIndex::load(root.join("index.json")).await,
        );
        (cache, blobs, legacy)
    }

    #[tokio::test]
    async fn test_legacy_hit_is_promoted() {
        let dir = tempdir().unwrap();
        let (cache, blobs, legacy) = build(dir.path(), 1024 * 1024).await;

        legacy
            .put("accordion", &sample_document("accordion"))
            .await
            .unwrap();

        let first = cache.lookup("accordion").await.unwrap();
        assert_eq!(
            first.tier,
            TierLevel::Persistent {
                depth: 1,
                name: "legacy"
            }
        );
        assert_eq!(first.payload.soundfont().instrument, "accordion");

        // Back-filled into the blob store and memory
        assert!(blobs.get("accordion").await.unwrap().is_some());
        let second = cache.lookup("accordion").await.unwrap();
        assert_eq!(second.tier, TierLevel::Memory);
    }

    #[tokio::test]
    async fn test_write_through_tolerates_failing_tier() {
        let dir = tempdir().unwrap();
        // Legacy store refuses anything over 8 bytes
        let (cache, blobs, legacy) = build(dir.path(), 8).await;
        let payload = Payload::decode("organ", sample_document("organ")).unwrap();

        let report = cache
            .write_through("organ", &payload, Some("https://a.example/organ.json"))
            .await;

        assert_eq!(report.written, vec!["memory", "blob-store"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "legacy");
        assert!(blobs.get("organ").await.unwrap().is_some());
        assert!(legacy.get("organ").await.unwrap().is_none());

        let entry = cache.index().get("organ").await.unwrap();
        assert_eq!(entry.source_url.as_deref(), Some("https://a.example/organ.json"));
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_evicted_and_misses() {
        let dir = tempdir().unwrap();
        let (cache, blobs, legacy) = build(dir.path(), 1024).await;
        blobs.put("harmonica", b"corrupt").await.unwrap();
        legacy.put("harmonica", b"corrupt").await.unwrap();

        assert!(cache.lookup("harmonica").await.is_none());
        assert!(blobs.get("harmonica").await.unwrap().is_none());
        assert!(legacy.get("harmonica").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_miss_without_any_tier_data() {
        let dir = tempdir().unwrap();
        let (cache, _, _) = build(dir.path(), 1024).await;
        assert!(cache.lookup("ocarina").await.is_none());
        assert_eq!(cache.tier_names(), vec!["memory", "blob-store", "legacy"]);
    }

    #[tokio::test]
    async fn test_rebuild_index_and_clear() {
        let dir = tempdir().unwrap();
        let (cache, blobs, legacy) = build(dir.path(), 1024 * 1024).await;
        blobs.put("a", &sample_document("a")).await.unwrap();
        legacy.put("a", &sample_document("a")).await.unwrap();
        legacy.put("b", &sample_document("b")).await.unwrap();

        assert_eq!(cache.rebuild_index().await.unwrap(), 2);
        assert_eq!(cache.index().len().await, 2);

        cache.clear().await.unwrap();
        assert_eq!(cache.index().len().await, 0);
        assert!(cache.lookup("b").await.is_none());
    }
}
