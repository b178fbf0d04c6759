//! In-memory transport for exercising the fetcher and coordinator

use crate::error::SourceError;
use crate::fetcher::SourceTransport;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) enum FakeResponse {
    Body(Vec<u8>),
    Status(u16),
    Hang,
}

/// Scripted transport. Each URL answers from a queue; the last response
/// repeats once the queue is down to one entry.
pub(crate) struct FakeTransport {
    routes: Mutex<HashMap<String, VecDeque<FakeResponse>>>,
    delay: Duration,
    calls: Mutex<Vec<(String, String)>>,
    invalidated: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            delay,
            calls: Mutex::new(Vec::new()),
            invalidated: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub(crate) fn route(&self, url: &str, response: FakeResponse) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn requested_urls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub(crate) fn keys_seen(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub(crate) fn invalidated(&self) -> Vec<String> {
        self.invalidated.lock().unwrap().clone()
    }

    pub(crate) fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_response(&self, url: &str) -> Option<FakeResponse> {
        let mut routes = self.routes.lock().unwrap();
        let queue = routes.get_mut(url)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl SourceTransport for FakeTransport {
    async fn get(&self, url: &str, key: &str) -> Result<Vec<u8>, SourceError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), key.to_string()));

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.next_response(url) {
            Some(FakeResponse::Body(data)) => Ok(data),
            Some(FakeResponse::Status(status)) => Err(SourceError::Status {
                url: url.to_string(),
                status,
            }),
            Some(FakeResponse::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(SourceError::Transport {
                    url: url.to_string(),
                    message: "hung".to_string(),
                })
            }
            None => Err(SourceError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }

    async fn invalidate(&self, url: &str) {
        self.invalidated.lock().unwrap().push(url.to_string());
    }
}
