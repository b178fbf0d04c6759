//! Control channel messages
//!
//! Request/response messages posted to `/control`, tagged by `type`.

use crate::error::Result;
use crate::proxy::{CacheProxy, VERSION};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    GetVersion,
    GetCacheStats,
    CleanupCache {
        #[serde(default, rename = "requiredSpace")]
        required_space: Option<u64>,
    },
    ProtectFavorite {
        identifier: String,
    },
    UnprotectFavorite {
        identifier: String,
    },
    SkipWaiting,
    ClearCache,
    /// Drop a cached body the client failed to decode
    InvalidateEntry {
        url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsReply {
    pub total_size: u64,
    pub soundfont_count: usize,
    pub critical_size: u64,
    /// Total byte limit
    pub quota: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ControlResponse {
    Version {
        version: String,
        #[serde(rename = "cacheNames")]
        cache_names: Vec<String>,
    },
    Stats(CacheStatsReply),
    Cleanup {
        #[serde(rename = "freedSpace")]
        freed_space: u64,
    },
    Success {
        success: bool,
    },
}

pub async fn handle(proxy: &CacheProxy, message: ControlMessage) -> Result<ControlResponse> {
    info!(message = ?message, "Control message");

    let response = match message {
        ControlMessage::GetVersion => ControlResponse::Version {
            version: VERSION.to_string(),
            cache_names: proxy.cache_names(),
        },
        ControlMessage::GetCacheStats => {
            let usage = proxy.store().usage().await;
            ControlResponse::Stats(CacheStatsReply {
                total_size: usage.total,
                soundfont_count: usage.soundfont_count,
                critical_size: usage.critical,
                quota: proxy.config().budget.total_limit,
            })
        }
        ControlMessage::CleanupCache { required_space } => {
            let report = proxy.cleanup(required_space).await;
            ControlResponse::Cleanup {
                freed_space: report.freed_bytes,
            }
        }
        ControlMessage::ProtectFavorite { identifier } => {
            proxy.protect(&identifier).await?;
            ControlResponse::Success { success: true }
        }
        ControlMessage::UnprotectFavorite { identifier } => {
            proxy.unprotect(&identifier).await?;
            ControlResponse::Success { success: true }
        }
        ControlMessage::SkipWaiting => ControlResponse::Success {
            success: proxy.skip_waiting().await?,
        },
        ControlMessage::ClearCache => {
            proxy.clear().await?;
            ControlResponse::Success { success: true }
        }
        ControlMessage::InvalidateEntry { url } => ControlResponse::Success {
            success: proxy.invalidate(&url).await?,
        },
    };

    Ok(response)
}
