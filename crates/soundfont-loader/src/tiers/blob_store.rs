//! Large-capacity persistent tier: one blob file per key

use super::PersistentTier;
use crate::error::TierError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Sidecar written next to each blob so keys can be recovered from disk
#[derive(Debug, Serialize, Deserialize)]
struct BlobMeta {
    key: String,
    size: u64,
    stored_at: DateTime<Utc>,
}

pub struct BlobStoreTier {
    dir: PathBuf,
}

impl BlobStoreTier {
    /// Open the store, creating its directory. Fails with
    /// `TierError::Unavailable` when the directory cannot be used.
    pub async fn open(dir: PathBuf) -> Result<Self, TierError> {
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| TierError::Unavailable(format!("{}: {}", dir.display(), e)))?;
        info!(dir = ?dir, "Blob store opened");
        Ok(Self { dir })
    }

    pub fn file_stem(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", Self::file_stem(key)))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::file_stem(key)))
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), TierError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl PersistentTier for BlobStoreTier {
    fn name(&self) -> &'static str {
        "blob-store"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        match fs::read(self.blob_path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), TierError> {
        let meta = BlobMeta {
            key: key.to_string(),
            size: data.len() as u64,
            stored_at: Utc::now(),
        };
        fs::write(self.blob_path(key), data).await?;
        fs::write(self.meta_path(key), serde_json::to_vec(&meta)?).await?;
        debug!(key, size = data.len(), "Stored blob");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), TierError> {
        remove_if_exists(&self.blob_path(key)).await?;
        remove_if_exists(&self.meta_path(key)).await
    }

    async fn keys(&self) -> Result<Vec<(String, u64)>, TierError> {
        let mut keys = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).await {
                Ok(raw) => match serde_json::from_slice::<BlobMeta>(&raw) {
                    Ok(meta) => keys.push((meta.key, meta.size)),
                    Err(e) => warn!(path = ?path, error = %e, "Skipping unreadable blob sidecar"),
                },
                Err(e) => warn!(path = ?path, error = %e, "Skipping unreadable blob sidecar"),
            }
        }

        Ok(keys)
    }

    async fn clear(&self) -> Result<(), TierError> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }
}
