//! Upstream fetching

use crate::error::{ProxyError, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP client for fetching responses from their origin
pub struct UpstreamFetcher {
    client: Client,
}

impl UpstreamFetcher {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Client with a whole-request timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Fetch `url`, returning the body and its content type
    pub async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String)> {
        debug!(url = %url, "Fetching upstream");

        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            warn!(status = %response.status(), url = %url, "Upstream request failed");
            return Err(ProxyError::Upstream {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let data = response.bytes().await?.to_vec();

        debug!(
            size = data.len(),
            content_type = %content_type,
            "Fetched upstream"
        );

        Ok((data, content_type))
    }
}

impl Default for UpstreamFetcher {
    fn default() -> Self {
        Self::new()
    }
}
