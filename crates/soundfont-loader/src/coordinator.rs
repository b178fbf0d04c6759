//! Download coordinator
//!
//! Entry point of the loader. Serves cache hits directly, shares one fetch
//! between concurrent callers of the same key, bounds the number of fetches
//! running at once, and retries the whole mirror chain on total failure.

use crate::config::RetryPolicy;
use crate::error::{LoadError, Result};
use crate::fetcher::MirrorFetcher;
use crate::payload::Payload;
use crate::registry::TaskRegistry;
use crate::tiered::TieredCache;
use crate::types::{CoordinatorStats, FetchedResource, ResourceDescriptor};
use futures::future::join_all;
use futures::FutureExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
    network_fetches: AtomicU64,
    failures: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CoordinatorStats {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let average_latency_ms = if samples == 0 {
            0.0
        } else {
            self.latency_total_ms.load(Ordering::Relaxed) as f64 / samples as f64
        };

        CoordinatorStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            network_fetches: self.network_fetches.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            average_latency_ms,
        }
    }
}

struct Inner {
    cache: Arc<TieredCache>,
    fetcher: MirrorFetcher,
    slots: Semaphore,
    tasks: TaskRegistry,
    retry: RetryPolicy,
    counters: Counters,
}

/// Cheap to clone; clones share the same cache, slots and in-flight tasks
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

impl DownloadCoordinator {
    pub fn new(
        cache: Arc<TieredCache>,
        fetcher: MirrorFetcher,
        concurrency_limit: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                fetcher,
                slots: Semaphore::new(concurrency_limit.max(1)),
                tasks: TaskRegistry::new(),
                retry,
                counters: Counters::default(),
            }),
        }
    }

    /// Turn a descriptor into a ready payload
    pub async fn acquire(&self, descriptor: &ResourceDescriptor) -> Result<Payload> {
        descriptor.validate()?;
        let key = &descriptor.key;

        if let Some(hit) = self.inner.cache.lookup(key).await {
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit.payload);
        }
        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);

        let claim = self
            .inner
            .tasks
            .claim(key, || {
                let inner = self.inner.clone();
                let descriptor = descriptor.clone();
                // Spawned so the fetch and cache write finish even if every
                // caller stops waiting.
                let handle = tokio::spawn(async move { inner.run(descriptor).await });
                async move {
                    handle
                        .await
                        .unwrap_or_else(|e| Err(LoadError::Internal(e.to_string())))
                }
                .boxed()
                .shared()
            })
            .await;

        if claim.is_joined() {
            self.inner.counters.joined.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Joined in-flight download");
        }

        claim.into_future().await
    }

    /// Acquire `descriptor`, falling back to `fallback` on terminal failure
    pub async fn acquire_or_fallback(
        &self,
        descriptor: &ResourceDescriptor,
        fallback: &ResourceDescriptor,
    ) -> Result<Payload> {
        match self.acquire(descriptor).await {
            Ok(payload) => Ok(payload),
            Err(e) => {
                warn!(
                    key = %descriptor.key,
                    fallback = %fallback.key,
                    error = %e,
                    "Falling back to default soundfont"
                );
                self.acquire(fallback).await
            }
        }
    }

    /// Acquire a batch concurrently; results keep the input order
    pub async fn preload(
        &self,
        descriptors: &[ResourceDescriptor],
    ) -> Vec<(String, Result<Payload>)> {
        let results = join_all(descriptors.iter().map(|d| self.acquire(d))).await;
        descriptors
            .iter()
            .map(|d| d.key.clone())
            .zip(results)
            .collect()
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.inner.counters.snapshot()
    }

    /// Number of downloads currently in flight
    pub async fn in_flight(&self) -> usize {
        self.inner.tasks.len().await
    }

    pub fn cache(&self) -> &TieredCache {
        &self.inner.cache
    }

    pub async fn last_source(&self, key: &str) -> Option<String> {
        self.inner.fetcher.last_source(key).await
    }
}

impl Inner {
    async fn run(self: Arc<Self>, descriptor: ResourceDescriptor) -> Result<Payload> {
        let key = descriptor.key.clone();

        // A previous task may have filled the cache between our lookup and claim
        let result = match self.cache.lookup(&key).await {
            Some(hit) => Ok(hit.payload),
            None => self.fetch_with_retry(&descriptor).await.map(|fetched| fetched.value),
        };

        match &result {
            Ok(_) => {}
            Err(e @ LoadError::Decode { .. }) => {
                error!(key = %key, error = %e, "Soundfont payload is malformed");
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.cache.remove(&key).await;
            }
            Err(e) => {
                error!(key = %key, error = %e, "Soundfont acquisition failed");
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.tasks.finish(&key).await;
        result
    }

    async fn fetch_with_retry(
        &self,
        descriptor: &ResourceDescriptor,
    ) -> Result<FetchedResource<Payload>> {
        let key = &descriptor.key;
        let total_attempts = self.retry.total_attempts();
        let mut last_error = None;

        for attempt in 1..=total_attempts {
            let result = {
                let _permit = self
                    .slots
                    .acquire()
                    .await
                    .map_err(|e| LoadError::Internal(e.to_string()))?;

                self.counters.network_fetches.fetch_add(1, Ordering::Relaxed);
                let started = Instant::now();
                let result = self
                    .fetcher
                    .fetch_with(descriptor, |bytes| {
                        Payload::decode(key, bytes).map_err(|e| e.to_string())
                    })
                    .await;
                if result.is_ok() {
                    self.record_latency(started);
                }
                result
            };

            match result {
                Ok(fetched) => {
                    self.cache
                        .write_through(key, &fetched.value, Some(&fetched.source))
                        .await;
                    info!(key = %key, attempt, source = %fetched.source, "Soundfont acquired");
                    return Ok(fetched);
                }
                // Retrying will not repair a malformed payload
                Err(e @ LoadError::Decode { .. }) => return Err(e),
                Err(e) => {
                    warn!(key = %key, attempt, total_attempts, error = %e, "Mirror chain failed");
                    last_error = Some(e);
                    if attempt < total_attempts {
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
            }
        }

        let last = last_error.unwrap_or_else(|| LoadError::AllSourcesExhausted {
            key: key.clone(),
            failures: Vec::new(),
        });
        if self.retry.extra_attempts == 0 {
            return Err(last);
        }
        Err(LoadError::RetriesExhausted {
            key: key.clone(),
            attempts: total_attempts,
            last: Box::new(last),
        })
    }

    fn record_latency(&self, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.counters
            .latency_total_ms
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        self.counters.latency_samples.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchTimeouts;
    use crate::index::MetadataIndex;
    use crate::payload::sample_document;
    use crate::test_support::{FakeResponse, FakeTransport};
    use crate::tiers::MemoryTier;
    use std::time::Duration;

    fn memory_cache() -> Arc<TieredCache> {
        Arc::new(TieredCache::new(
            MemoryTier::new(16 * 1024 * 1024),
            Vec::new(),
            MetadataIndex::in_memory(),
        ))
    }

    fn coordinator(transport: Arc<FakeTransport>, limit: usize, retry: RetryPolicy) -> DownloadCoordinator {
        let fetcher = MirrorFetcher::new(
            transport,
            FetchTimeouts {
                local: Duration::from_millis(100),
                remote: Duration::from_millis(500),
            },
        );
        DownloadCoordinator::new(memory_cache(), fetcher, limit, retry)
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy {
            extra_attempts: 0,
            delay: Duration::ZERO,
        }
    }

    fn descriptor(key: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(
            key,
            &format!("{}.json", key),
            vec!["https://mirror.example".to_string()],
        )
    }

    fn route_ok(transport: &FakeTransport, key: &str) {
        transport.route(
            &format!("https://mirror.example/{}.json", key),
            FakeResponse::Body(sample_document(key)),
        );
    }

    #[tokio::test]
    async fn test_concurrent_acquires_share_one_fetch() {
        let transport = Arc::new(FakeTransport::with_delay(Duration::from_millis(50)));
        route_ok(&transport, "trumpet");
        let coordinator = coordinator(transport.clone(), 3, no_retry());
        let d = descriptor("trumpet");

        let results = join_all((0..8).map(|_| coordinator.acquire(&d))).await;

        assert_eq!(transport.call_count(), 1);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert_eq!(result.as_ref().unwrap().bytes(), first.bytes());
        }
        let stats = coordinator.stats();
        assert_eq!(stats.network_fetches, 1);
        assert_eq!(stats.joined, 7);
        assert_eq!(coordinator.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_joined_callers_share_failure() {
        let transport = Arc::new(FakeTransport::with_delay(Duration::from_millis(50)));
        transport.route("https://mirror.example/horn.json", FakeResponse::Status(500));
        let coordinator = coordinator(transport.clone(), 3, no_retry());
        let d = descriptor("horn");

        let results = join_all((0..4).map(|_| coordinator.acquire(&d))).await;

        assert_eq!(transport.call_count(), 1);
        for result in results {
            assert!(matches!(
                result,
                Err(LoadError::AllSourcesExhausted { ref key, .. }) if key == "horn"
            ));
        }
        assert_eq!(coordinator.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let transport = Arc::new(FakeTransport::with_delay(Duration::from_millis(30)));
        let keys: Vec<String> = (0..10).map(|i| format!("inst{}", i)).collect();
        for key in &keys {
            route_ok(&transport, key);
        }
        let coordinator = coordinator(transport.clone(), 3, no_retry());
        let descriptors: Vec<ResourceDescriptor> = keys.iter().map(|k| descriptor(k)).collect();

        let results = coordinator.preload(&descriptors).await;

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(results[4].0, "inst4");
        assert_eq!(transport.call_count(), 10);
        assert!(transport.max_active() <= 3);
        assert!(transport.max_active() >= 2);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let transport = Arc::new(FakeTransport::new());
        route_ok(&transport, "piccolo");
        let coordinator = coordinator(transport.clone(), 3, no_retry());
        let d = descriptor("piccolo");

        coordinator.acquire(&d).await.unwrap();
        coordinator.acquire(&d).await.unwrap();

        assert_eq!(transport.call_count(), 1);
        let stats = coordinator.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(
            coordinator.last_source("piccolo").await.as_deref(),
            Some("https://mirror.example/piccolo.json")
        );
    }

    #[tokio::test]
    async fn test_whole_chain_retry_then_success() {
        let transport = Arc::new(FakeTransport::new());
        transport.route("https://mirror.example/cello.json", FakeResponse::Status(503));
        transport.route("https://mirror.example/cello.json", FakeResponse::Status(503));
        transport.route(
            "https://mirror.example/cello.json",
            FakeResponse::Body(sample_document("cello")),
        );
        let retry = RetryPolicy {
            extra_attempts: 2,
            delay: Duration::from_millis(10),
        };
        let coordinator = coordinator(transport.clone(), 3, retry);

        let payload = coordinator.acquire(&descriptor("cello")).await.unwrap();
        assert_eq!(payload.soundfont().instrument, "cello");
        assert_eq!(transport.call_count(), 3);
        assert_eq!(coordinator.stats().network_fetches, 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let transport = Arc::new(FakeTransport::new());
        transport.route("https://mirror.example/bells.json", FakeResponse::Status(502));
        let retry = RetryPolicy {
            extra_attempts: 2,
            delay: Duration::from_millis(5),
        };
        let coordinator = coordinator(transport.clone(), 3, retry);

        let err = coordinator.acquire(&descriptor("bells")).await.unwrap_err();
        match err {
            LoadError::RetriesExhausted { key, attempts, last } => {
                assert_eq!(key, "bells");
                assert_eq!(attempts, 3);
                assert!(matches!(*last, LoadError::AllSourcesExhausted { .. }));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_decode_error_is_not_retried() {
        let transport = Arc::new(FakeTransport::new());
        transport.route(
            "https://mirror.example/drums.json",
            FakeResponse::Body(b"MIDI.Soundfont.drums = {}".to_vec()),
        );
        let coordinator = coordinator(transport.clone(), 3, RetryPolicy::default());

        let err = coordinator.acquire(&descriptor("drums")).await.unwrap_err();
        assert!(matches!(err, LoadError::Decode { .. }));
        assert_eq!(transport.call_count(), 1);
        assert!(coordinator.cache().lookup("drums").await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_descriptor_rejected() {
        let transport = Arc::new(FakeTransport::new());
        let coordinator = coordinator(transport.clone(), 3, no_retry());
        let d = ResourceDescriptor::new("empty", "empty.json", vec![]);

        let err = coordinator.acquire(&d).await.unwrap_err();
        assert!(matches!(err, LoadError::InvalidDescriptor(_)));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_fallback_on_failure() {
        let transport = Arc::new(FakeTransport::new());
        transport.route("https://mirror.example/theremin.json", FakeResponse::Status(404));
        route_ok(&transport, "acoustic_grand_piano");
        let coordinator = coordinator(transport, 3, no_retry());

        let payload = coordinator
            .acquire_or_fallback(&descriptor("theremin"), &descriptor("acoustic_grand_piano"))
            .await
            .unwrap();
        assert_eq!(payload.key(), "acoustic_grand_piano");
    }

    #[tokio::test]
    async fn test_fetch_completes_after_caller_drops() {
        let transport = Arc::new(FakeTransport::with_delay(Duration::from_millis(50)));
        route_ok(&transport, "harpsichord");
        let coordinator = coordinator(transport.clone(), 3, no_retry());
        let d = descriptor("harpsichord");

        let abandoned =
            tokio::time::timeout(Duration::from_millis(5), coordinator.acquire(&d)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(coordinator.cache().lookup("harpsichord").await.is_some());
        assert_eq!(transport.call_count(), 1);
    }
}
