//! Core types for the soundfont cache proxy

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Storage class of a cached response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Application assets, precached and never evicted
    Critical,
    /// Instrument payloads, cache-first and evictable
    Soundfont,
    /// Everything else, network-first
    Generic,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Critical, Category::Soundfont, Category::Generic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Critical => "critical",
            Category::Soundfont => "soundfont",
            Category::Generic => "generic",
        }
    }
}

/// Metadata for a cached response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    /// Resource key supplied by the loader, if any
    pub resource_key: Option<String>,
    pub category: Category,
    pub content_type: String,
    pub size_bytes: u64,
    pub cached_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub protected: bool,
    pub path: PathBuf,
}

/// Byte budget enforced by the eviction engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Budget {
    pub total_limit: u64,
    pub soundfont_limit: u64,
    pub critical_limit: u64,
    pub min_free_space: u64,
    pub max_soundfont_entries: usize,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            total_limit: 500 * 1024 * 1024,     // 500MB
            soundfont_limit: 450 * 1024 * 1024, // 450MB
            critical_limit: 50 * 1024 * 1024,   // 50MB
            min_free_space: 50 * 1024 * 1024,   // 50MB
            max_soundfont_entries: 1000,
        }
    }
}

impl Budget {
    /// Total usage above which eviction runs (85%)
    pub fn trigger_usage(&self) -> u64 {
        percent_of(self.total_limit, 85)
    }

    /// Total usage eviction aims for: 70% of the limit, or lower when
    /// `min_free_space` demands it
    pub fn target_usage(&self) -> u64 {
        let floor = self.total_limit.saturating_sub(self.min_free_space);
        percent_of(self.total_limit, 70).min(floor)
    }

    /// Soundfont entry count above which eviction runs (90%)
    pub fn entry_trigger(&self) -> usize {
        self.max_soundfont_entries * 9 / 10
    }

    pub fn entry_target(&self) -> usize {
        self.max_soundfont_entries * 7 / 10
    }
}

fn percent_of(value: u64, percent: u64) -> u64 {
    (u128::from(value) * u128::from(percent) / 100) as u64
}

/// Current usage, per category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub total: u64,
    pub critical: u64,
    pub soundfont: u64,
    pub generic: u64,
    pub soundfont_count: usize,
}

/// Configuration for the cache proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub cache_dir: PathBuf,
    pub budget: Budget,
    /// URLs precached at startup and never evicted
    pub critical_urls: Vec<String>,
    /// Soundfont identifiers that are never evicted
    pub essential_keys: Vec<String>,
    /// URL substrings that mark a request as a soundfont
    pub soundfont_patterns: Vec<String>,
    /// Entries accessed more recently than this are not eviction candidates
    pub recent_access_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 3005,
            cache_dir: PathBuf::from("./cache/proxy"),
            budget: Budget::default(),
            critical_urls: Vec::new(),
            essential_keys: vec!["acoustic_grand_piano".to_string()],
            soundfont_patterns: vec![
                "/soundfonts/".to_string(),
                "midi-js-soundfonts".to_string(),
                "-mp3.js".to_string(),
                "-ogg.js".to_string(),
            ],
            recent_access_grace: Duration::from_secs(60),
        }
    }
}

/// Query parameters of `GET /fetch`
#[derive(Debug, Clone, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    pub key: Option<String>,
    pub category: Option<String>,
}

/// Statistics about the proxy store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub critical_size: u64,
    pub soundfont_size: u64,
    pub generic_size: u64,
    pub soundfont_count: usize,
    pub protected_count: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub lifecycle: String,
    pub favorites: Vec<String>,
    pub cache: CacheStats,
}
