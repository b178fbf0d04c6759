//! Soundfont Cache Proxy - byte-budgeted caching proxy for soundfont downloads
//!
//! Sits between the soundfont loader and the mirrors, keeps a persistent
//! copy of everything it serves and evicts low-value soundfonts when the
//! cache grows past its budget. Favorites pinned through the control
//! channel are never evicted.

mod control;
mod error;
mod eviction;
mod pins;
mod proxy;
mod server;
mod store;
mod types;
mod upstream;

#[cfg(test)]
mod test_support;

use crate::error::{ProxyError, Result};
use crate::proxy::CacheProxy;
use crate::server::{start_server, ServerState, SharedState};
use crate::types::{Budget, ProxyConfig};
use crate::upstream::UpstreamFetcher;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter =
        EnvFilter::from_default_env().add_directive("soundfont_cache_proxy=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting Soundfont Cache Proxy...");

    let config = load_config()?;
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.cache_dir);
    info!(
        "Total cache limit: {} MB",
        config.budget.total_limit / (1024 * 1024)
    );
    info!(
        "Soundfont cache limit: {} MB, max {} entries",
        config.budget.soundfont_limit / (1024 * 1024),
        config.budget.max_soundfont_entries
    );
    info!("Critical assets: {}", config.critical_urls.len());

    let port = config.port;
    let upstream = UpstreamFetcher::with_timeout(Duration::from_secs(60))?;
    let proxy = CacheProxy::open(config, upstream).await?;

    let lifecycle = proxy.start().await?;
    info!("Lifecycle: {}", lifecycle.as_str());

    let state: SharedState = Arc::new(ServerState::new(proxy));

    // Spawn access data saver (every 30 seconds)
    let flush_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            if let Err(e) = flush_state.proxy.flush().await {
                error!("Failed to save access data: {}", e);
            }
        }
    });

    // Start HTTP server (blocking until shutdown)
    start_server(state.clone(), port)
        .await
        .map_err(|e| ProxyError::Config(format!("Server error: {}", e)))?;

    state.proxy.flush().await?;
    info!("Access data saved, exiting");

    Ok(())
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_list(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|raw| parse_list(&raw))
}

/// Comma-separated list, blanks dropped
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn load_config() -> Result<ProxyConfig> {
    let defaults = ProxyConfig::default();

    let port = match std::env::var("PORT") {
        Ok(raw) => raw
            .parse::<u16>()
            .map_err(|e| ProxyError::Config(format!("invalid PORT {:?}: {}", raw, e)))?,
        Err(_) => defaults.port,
    };

    let cache_dir = std::env::var("CACHE_DIR")
        .map(PathBuf::from)
        .unwrap_or(defaults.cache_dir);

    let budget = Budget {
        total_limit: env_u64("TOTAL_CACHE_LIMIT", defaults.budget.total_limit),
        soundfont_limit: env_u64("SOUNDFONT_CACHE_LIMIT", defaults.budget.soundfont_limit),
        critical_limit: env_u64("CRITICAL_CACHE_LIMIT", defaults.budget.critical_limit),
        min_free_space: env_u64("MIN_FREE_SPACE", defaults.budget.min_free_space),
        max_soundfont_entries: env_u64(
            "MAX_SOUNDFONT_ENTRIES",
            defaults.budget.max_soundfont_entries as u64,
        ) as usize,
    };
    if budget.soundfont_limit > budget.total_limit {
        return Err(ProxyError::Config(format!(
            "SOUNDFONT_CACHE_LIMIT ({}) exceeds TOTAL_CACHE_LIMIT ({})",
            budget.soundfont_limit, budget.total_limit
        )));
    }

    Ok(ProxyConfig {
        port,
        cache_dir,
        budget,
        critical_urls: env_list("CRITICAL_URLS").unwrap_or(defaults.critical_urls),
        essential_keys: env_list("ESSENTIAL_KEYS").unwrap_or(defaults.essential_keys),
        ..defaults
    })
}
