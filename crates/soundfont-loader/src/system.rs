//! Wiring: builds the tiers, fetcher and coordinator from a `LoaderConfig`

use crate::config::LoaderConfig;
use crate::coordinator::DownloadCoordinator;
use crate::error::TierError;
use crate::fetcher::{HttpTransport, MirrorFetcher, SourceTransport};
use crate::index::MetadataIndex;
use crate::tiered::TieredCache;
use crate::tiers::{BlobStoreTier, LegacyTier, MemoryTier, PersistentTier};
use std::sync::Arc;
use tracing::{info, warn};

/// One loader instance: owns the tiered cache and the coordinator
pub struct CacheSystem {
    config: LoaderConfig,
    cache: Arc<TieredCache>,
    coordinator: DownloadCoordinator,
}

impl CacheSystem {
    /// Open with the HTTP transport, routed through `config.proxy_url` if set
    pub async fn open(config: LoaderConfig) -> Result<Self, TierError> {
        let transport: Arc<dyn SourceTransport> = match &config.proxy_url {
            Some(proxy) => Arc::new(HttpTransport::with_proxy(proxy)),
            None => Arc::new(HttpTransport::new()),
        };
        Self::open_with_transport(config, transport).await
    }

    pub async fn open_with_transport(
        config: LoaderConfig,
        transport: Arc<dyn SourceTransport>,
    ) -> Result<Self, TierError> {
        // Without a usable cache directory the loader still runs, memory only
        let disk_ready = match tokio::fs::create_dir_all(&config.cache_dir).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    cache_dir = ?config.cache_dir,
                    error = %e,
                    "Cache directory unavailable, persistent tiers disabled"
                );
                false
            }
        };

        let mut persistent: Vec<Arc<dyn PersistentTier>> = Vec::new();

        if disk_ready && config.enable_large_store {
            match BlobStoreTier::open(config.large_store_dir()).await {
                Ok(tier) => persistent.push(Arc::new(tier)),
                Err(e) => warn!(error = %e, "Blob store unavailable, skipping"),
            }
        }

        if disk_ready {
            match LegacyTier::open(config.legacy_store_dir(), config.legacy_entry_limit).await {
                Ok(tier) => persistent.push(Arc::new(tier)),
                Err(e) => warn!(error = %e, "Legacy store unavailable, skipping"),
            }
        }

        let index = if disk_ready {
            MetadataIndex::load(config.index_path()).await
        } else {
            MetadataIndex::in_memory()
        };
        let cache = Arc::new(TieredCache::new(
            MemoryTier::new(config.memory_capacity_bytes),
            persistent,
            index,
        ));

        let fetcher = MirrorFetcher::new(transport, config.timeouts);
        let coordinator = DownloadCoordinator::new(
            cache.clone(),
            fetcher,
            config.concurrency_limit,
            config.retry,
        );

        info!(
            cache_dir = ?config.cache_dir,
            tiers = ?cache.tier_names(),
            concurrency = config.concurrency_limit,
            "Soundfont cache system ready"
        );

        Ok(Self {
            config,
            cache,
            coordinator,
        })
    }

    pub fn coordinator(&self) -> &DownloadCoordinator {
        &self.coordinator
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }
}
