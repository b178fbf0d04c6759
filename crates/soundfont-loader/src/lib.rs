//! Soundfont loader
//!
//! Turns a resource descriptor into a decoded soundfont payload: cache hits
//! are served from memory or disk, misses are fetched from an ordered list of
//! mirrors with deduplication, bounded concurrency and whole-chain retry.
//!
//! ```ignore
//! let system = CacheSystem::open(LoaderConfig::from_env()).await?;
//! let payload = system.coordinator().acquire(&descriptor).await?;
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod index;
pub mod payload;
pub mod registry;
pub mod system;
pub mod tiered;
pub mod tiers;
pub mod types;

#[cfg(test)]
mod test_support;

pub use config::{FetchTimeouts, LoaderConfig, RetryPolicy};
pub use coordinator::DownloadCoordinator;
pub use error::{LoadError, Result, SourceError, TierError};
pub use fetcher::{is_local_source, HttpTransport, MirrorFetcher, SourceTransport};
pub use index::MetadataIndex;
pub use payload::{Payload, Soundfont};
pub use system::CacheSystem;
pub use tiered::{CacheHit, TierLevel, TieredCache, WriteReport};
pub use types::{CoordinatorStats, FetchedResource, IndexEntry, ResourceDescriptor};
