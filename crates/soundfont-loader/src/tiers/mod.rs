//! Cache tiers
//!
//! The memory tier holds decoded payloads and never performs I/O. Persistent
//! tiers hold raw bytes and implement [`PersistentTier`].

mod blob_store;
mod legacy;
mod memory;

pub use blob_store::BlobStoreTier;
pub use legacy::LegacyTier;
pub use memory::MemoryTier;

use crate::error::TierError;
use async_trait::async_trait;

/// A persistent byte store that survives restarts
#[async_trait]
pub trait PersistentTier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError>;

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), TierError>;

    async fn remove(&self, key: &str) -> Result<(), TierError>;

    /// Every stored key with its size in bytes
    async fn keys(&self) -> Result<Vec<(String, u64)>, TierError>;

    async fn clear(&self) -> Result<(), TierError>;
}
