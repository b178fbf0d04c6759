//! Legacy persistent tier: small per-entry files named after the key
//!
//! Used as the fallback store when the blob store is unavailable. Entries
//! above `max_entry_size` are refused.

use super::PersistentTier;
use crate::error::TierError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

const EXTENSION: &str = "dat";

pub struct LegacyTier {
    dir: PathBuf,
    max_entry_size: u64,
}

impl LegacyTier {
    pub async fn open(dir: PathBuf, max_entry_size: u64) -> Result<Self, TierError> {
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| TierError::Unavailable(format!("{}: {}", dir.display(), e)))?;
        Ok(Self {
            dir,
            max_entry_size,
        })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", urlencoding::encode(key), EXTENSION))
    }
}

#[async_trait]
impl PersistentTier for LegacyTier {
    fn name(&self) -> &'static str {
        "legacy"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TierError> {
        match fs::read(self.entry_path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), TierError> {
        let size = data.len() as u64;
        if size > self.max_entry_size {
            return Err(TierError::TooLarge {
                size,
                limit: self.max_entry_size,
            });
        }
        fs::write(self.entry_path(key), data).await?;
        debug!(key, size, "Stored legacy entry");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), TierError> {
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<(String, u64)>, TierError> {
        let mut keys = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(key) = urlencoding::decode(stem) {
                let size = entry.metadata().await?.len();
                keys.push((key.into_owned(), size));
            }
        }

        Ok(keys)
    }

    async fn clear(&self) -> Result<(), TierError> {
        for (key, _) in self.keys().await? {
            self.remove(&key).await?;
        }
        Ok(())
    }
}
