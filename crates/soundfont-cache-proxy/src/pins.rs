//! Favorites: soundfont identifiers the user has pinned against eviction

use crate::error::Result;
use crate::types::CacheEntry;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

/// Identifier a pin or an essential key is compared against: the resource
/// key if the loader supplied one, otherwise the file stem of the URL
pub fn entry_identifier(entry: &CacheEntry) -> Option<String> {
    entry
        .resource_key
        .clone()
        .or_else(|| url_identifier(&entry.url))
}

/// `https://host/FluidR3_GM/acoustic_grand_piano-mp3.js` -> `acoustic_grand_piano`
pub fn url_identifier(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.rev().find(|s| !s.is_empty())?;
    let decoded = urlencoding::decode(segment).ok()?;
    let stem = decoded.split('.').next().unwrap_or_default();
    let stem = stem
        .strip_suffix("-mp3")
        .or_else(|| stem.strip_suffix("-ogg"))
        .unwrap_or(stem);

    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

/// Persisted to `pins.json`
pub struct PinSet {
    path: PathBuf,
    pins: RwLock<BTreeSet<String>>,
}

impl PinSet {
    /// Load pins from `path`; a missing or unreadable file starts empty
    pub async fn load(path: PathBuf) -> Self {
        let pins = match fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<BTreeSet<String>>(&raw).unwrap_or_else(|e| {
                warn!(path = ?path, error = %e, "Discarding corrupt pin file");
                BTreeSet::new()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read pin file");
                BTreeSet::new()
            }
        };

        debug!(pins = pins.len(), "Pins loaded");
        Self {
            path,
            pins: RwLock::new(pins),
        }
    }

    /// Returns false if the identifier was already pinned
    pub async fn protect(&self, identifier: &str) -> Result<bool> {
        let inserted = self.pins.write().await.insert(identifier.to_string());
        if inserted {
            self.persist().await?;
        }
        Ok(inserted)
    }

    /// Returns false if the identifier was not pinned
    pub async fn unprotect(&self, identifier: &str) -> Result<bool> {
        let removed = self.pins.write().await.remove(identifier);
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    pub async fn contains(&self, identifier: &str) -> bool {
        self.pins.read().await.contains(identifier)
    }

    pub async fn list(&self) -> Vec<String> {
        self.pins.read().await.iter().cloned().collect()
    }

    async fn persist(&self) -> Result<()> {
        let raw = serde_json::to_vec(&*self.pins.read().await)?;
        fs::write(&self.path, raw).await?;
        Ok(())
    }
}
