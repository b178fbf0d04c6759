use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Per-attempt timeouts for the mirror fetcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTimeouts {
    pub local: Duration,
    /// Remote payloads can reach several megabytes
    pub remote: Duration,
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        Self {
            local: Duration::from_secs(5),
            remote: Duration::from_secs(60),
        }
    }
}

/// Whole-chain retry after every mirror has failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub extra_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            extra_attempts: 2,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn total_attempts(&self) -> u32 {
        self.extra_attempts + 1
    }
}

/// Loader configuration
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub cache_dir: PathBuf,
    pub concurrency_limit: usize,
    pub memory_capacity_bytes: u64,
    /// Largest entry the legacy store accepts
    pub legacy_entry_limit: u64,
    pub enable_large_store: bool,
    pub proxy_url: Option<String>,
    pub timeouts: FetchTimeouts,
    pub retry: RetryPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache/soundfonts"),
            concurrency_limit: 3,
            memory_capacity_bytes: 256 * 1024 * 1024, // 256MB
            legacy_entry_limit: 5 * 1024 * 1024,      // 5MB
            enable_large_store: true,
            proxy_url: None,
            timeouts: FetchTimeouts::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl LoaderConfig {
    /// Parse configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cache_dir = env::var("SOUNDFONT_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let concurrency_limit = env::var("SOUNDFONT_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.concurrency_limit);

        let proxy_url = env::var("SOUNDFONT_PROXY_URL")
            .ok()
            .filter(|s| !s.is_empty());

        Self {
            cache_dir,
            concurrency_limit,
            proxy_url,
            ..defaults
        }
    }

    pub fn large_store_dir(&self) -> PathBuf {
        self.cache_dir.join("blobs")
    }

    pub fn legacy_store_dir(&self) -> PathBuf {
        self.cache_dir.join("legacy")
    }

    pub fn index_path(&self) -> PathBuf {
        self.cache_dir.join("index.json")
    }
}
