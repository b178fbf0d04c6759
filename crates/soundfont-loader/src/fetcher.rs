//! Mirror fetching
//!
//! Tries each source of a descriptor in order (bundled local copy first, then
//! remote mirrors) with a per-attempt timeout, and returns the first payload
//! that validates.

use crate::config::FetchTimeouts;
use crate::error::{LoadError, SourceError};
use crate::types::{FetchedResource, ResourceDescriptor};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::{Host, Url};

/// Retrieves the raw bytes behind one source URL
#[async_trait]
pub trait SourceTransport: Send + Sync {
    /// `key` is the resource key the URL belongs to, forwarded so that
    /// intermediaries can attribute the bytes to a resource.
    async fn get(&self, url: &str, key: &str) -> Result<Vec<u8>, SourceError>;

    /// Report that the bytes served for `url` failed validation, so a cache
    /// in the path can drop them. No-op when nothing caches in between.
    async fn invalidate(&self, _url: &str) {}
}

/// Whether a source is served from this machine (bundled files, loopback)
pub fn is_local_source(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "file" => true,
        Ok(parsed) => match parsed.host() {
            Some(Host::Domain(domain)) => domain == "localhost",
            Some(Host::Ipv4(ip)) => ip.is_loopback(),
            Some(Host::Ipv6(ip)) => ip.is_loopback(),
            None => false,
        },
        Err(_) => false,
    }
}

/// HTTP transport, optionally routed through the soundfont cache proxy
pub struct HttpTransport {
    client: Client,
    proxy_url: Option<String>,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            proxy_url: None,
        }
    }

    /// Route remote requests through a cache proxy at `proxy_url`
    pub fn with_proxy(proxy_url: &str) -> Self {
        Self {
            client: Client::new(),
            proxy_url: Some(proxy_url.trim_end_matches('/').to_string()),
        }
    }

    /// URL actually requested for a source
    pub fn request_url(&self, url: &str, key: &str) -> String {
        match &self.proxy_url {
            Some(proxy) if !is_local_source(url) => format!(
                "{}/fetch?url={}&key={}&category=soundfont",
                proxy,
                urlencoding::encode(url),
                urlencoding::encode(key)
            ),
            _ => url.to_string(),
        }
    }

    async fn read_file(url: &str) -> Result<Vec<u8>, SourceError> {
        let path = Url::parse(url)
            .ok()
            .and_then(|u| u.to_file_path().ok())
            .ok_or_else(|| SourceError::Transport {
                url: url.to_string(),
                message: "invalid file URL".to_string(),
            })?;

        tokio::fs::read(&path)
            .await
            .map_err(|e| SourceError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceTransport for HttpTransport {
    async fn get(&self, url: &str, key: &str) -> Result<Vec<u8>, SourceError> {
        if url.starts_with("file://") {
            return Self::read_file(url).await;
        }

        let request_url = self.request_url(url, key);
        debug!(url = %request_url, key, "Fetching soundfont source");

        let transport_error = |e: reqwest::Error| SourceError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self
            .client
            .get(&request_url)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(SourceError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let data = response.bytes().await.map_err(transport_error)?.to_vec();
        Ok(data)
    }

    async fn invalidate(&self, url: &str) {
        let Some(proxy) = &self.proxy_url else {
            return;
        };
        if is_local_source(url) {
            return;
        }

        let message = serde_json::json!({ "type": "INVALIDATE_ENTRY", "url": url });
        let result = self
            .client
            .post(format!("{}/control", proxy))
            .json(&message)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(url, "Invalidated proxy entry")
            }
            Ok(response) => warn!(url, status = %response.status(), "Proxy refused invalidation"),
            Err(e) => warn!(url, error = %e, "Failed to invalidate proxy entry"),
        }
    }
}

/// Ordered mirror fallback for a single resource
pub struct MirrorFetcher {
    transport: Arc<dyn SourceTransport>,
    timeouts: FetchTimeouts,
    /// Resource key to the source that last served it
    last_sources: RwLock<HashMap<String, String>>,
}

impl MirrorFetcher {
    pub fn new(transport: Arc<dyn SourceTransport>, timeouts: FetchTimeouts) -> Self {
        Self {
            transport,
            timeouts,
            last_sources: RwLock::new(HashMap::new()),
        }
    }

    pub fn timeout_for(&self, url: &str) -> Duration {
        if is_local_source(url) {
            self.timeouts.local
        } else {
            self.timeouts.remote
        }
    }

    /// Fetch raw bytes, rejecting empty bodies
    pub async fn fetch(
        &self,
        descriptor: &ResourceDescriptor,
    ) -> Result<FetchedResource<Vec<u8>>, LoadError> {
        self.fetch_with(descriptor, Ok).await
    }

    /// Fetch and validate with `decode`; a source whose bytes fail to decode
    /// is skipped like any other failed source.
    pub async fn fetch_with<T, F>(
        &self,
        descriptor: &ResourceDescriptor,
        decode: F,
    ) -> Result<FetchedResource<T>, LoadError>
    where
        F: Fn(Vec<u8>) -> Result<T, String>,
    {
        descriptor.validate()?;
        let key = &descriptor.key;
        let mut failures = Vec::new();

        for (index, url) in descriptor.source_urls().into_iter().enumerate() {
            let timeout = self.timeout_for(&url);
            debug!(key = %key, source = %url, ?timeout, "Trying source");

            let attempt = match tokio::time::timeout(timeout, self.transport.get(&url, key)).await
            {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout {
                    url: url.clone(),
                    after: timeout,
                }),
            };

            let bytes = match attempt {
                Ok(bytes) if bytes.is_empty() => {
                    self.transport.invalidate(&url).await;
                    let err = SourceError::Malformed {
                        url: url.clone(),
                        message: "empty body".to_string(),
                    };
                    warn!(key = %key, error = %err, "Source failed");
                    failures.push(err);
                    continue;
                }
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(key = %key, error = %err, "Source failed");
                    failures.push(err);
                    continue;
                }
            };

            let size = bytes.len() as u64;
            match decode(bytes) {
                Ok(value) => {
                    self.last_sources
                        .write()
                        .await
                        .insert(key.clone(), url.clone());
                    info!(key = %key, source = %url, size, "Fetched soundfont");
                    return Ok(FetchedResource {
                        value,
                        source: url,
                        source_index: index,
                        size,
                    });
                }
                Err(message) => {
                    self.transport.invalidate(&url).await;
                    let err = SourceError::Malformed { url, message };
                    warn!(key = %key, error = %err, "Source failed");
                    failures.push(err);
                }
            }
        }

        if let Some(last) = failures.last() {
            if failures.iter().all(SourceError::is_malformed) {
                return Err(LoadError::Decode {
                    key: key.clone(),
                    message: last.to_string(),
                });
            }
        }

        Err(LoadError::AllSourcesExhausted {
            key: key.clone(),
            failures,
        })
    }

    /// Source that most recently served `key`, for diagnostics
    pub async fn last_source(&self, key: &str) -> Option<String> {
        self.last_sources.read().await.get(key).cloned()
    }
}
