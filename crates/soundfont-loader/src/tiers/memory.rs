use crate::payload::Payload;
use moka::future::Cache;

/// In-process payload cache, weighted by payload bytes
pub struct MemoryTier {
    cache: Cache<String, Payload>,
}

impl MemoryTier {
    pub fn new(capacity_bytes: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity_bytes)
            .weigher(|_key: &String, payload: &Payload| {
                u32::try_from(payload.size_bytes()).unwrap_or(u32::MAX)
            })
            .build();

        Self { cache }
    }

    pub async fn get(&self, key: &str) -> Option<Payload> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, payload: Payload) {
        self.cache
            .insert(payload.key().to_string(), payload)
            .await;
    }

    pub async fn remove(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}
