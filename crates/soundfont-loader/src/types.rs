//! Core types for the soundfont loader

use crate::error::LoadError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Location metadata for one downloadable soundfont, supplied by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub key: String,
    pub relative_path: String,
    pub sources: Vec<String>,
}

impl ResourceDescriptor {
    pub fn new(key: &str, relative_path: &str, sources: Vec<String>) -> Self {
        Self {
            key: key.to_string(),
            relative_path: relative_path.to_string(),
            sources,
        }
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        if self.key.is_empty() {
            return Err(LoadError::InvalidDescriptor("empty key".to_string()));
        }
        if self.sources.is_empty() {
            return Err(LoadError::InvalidDescriptor(format!(
                "no sources for {}",
                self.key
            )));
        }
        Ok(())
    }

    /// Full URLs to try, in source order
    pub fn source_urls(&self) -> Vec<String> {
        self.sources
            .iter()
            .map(|base| join_url(base, &self.relative_path))
            .collect()
    }
}

fn join_url(base: &str, relative_path: &str) -> String {
    if relative_path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        relative_path.trim_start_matches('/')
    )
}

/// Bytes retrieved by the mirror fetcher plus the source that served them
#[derive(Debug, Clone)]
pub struct FetchedResource<T> {
    pub value: T,
    pub source: String,
    pub source_index: usize,
    pub size: u64,
}

/// Advisory metadata about a key held by the tiered cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub source_url: Option<String>,
    pub size_bytes: u64,
    pub cached_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

/// Snapshot of download coordinator counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub hits: u64,
    pub misses: u64,
    pub joined: u64,
    pub network_fetches: u64,
    pub failures: u64,
    pub average_latency_ms: f64,
}
