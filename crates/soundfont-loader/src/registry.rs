//! In-flight download registry
//!
//! Holds at most one `DownloadTask` per key. Check-and-insert happens under a
//! single lock so concurrent callers for the same key always share one fetch.

use crate::error::LoadError;
use crate::payload::Payload;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use tokio::sync::Mutex;

pub type SharedLoad = Shared<BoxFuture<'static, Result<Payload, LoadError>>>;

struct DownloadTask {
    future: SharedLoad,
    ref_count: usize,
}

/// Result of claiming a key
pub enum Claim {
    /// A new task was started by this caller
    Started(SharedLoad),
    /// An existing task was joined
    Joined(SharedLoad),
}

impl Claim {
    pub fn into_future(self) -> SharedLoad {
        match self {
            Claim::Started(f) | Claim::Joined(f) => f,
        }
    }

    pub fn is_joined(&self) -> bool {
        matches!(self, Claim::Joined(_))
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, DownloadTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the task for `key`, or start one with `start` if none exists
    pub async fn claim<F>(&self, key: &str, start: F) -> Claim
    where
        F: FnOnce() -> SharedLoad,
    {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get_mut(key) {
            task.ref_count += 1;
            return Claim::Joined(task.future.clone());
        }

        let future = start();
        tasks.insert(
            key.to_string(),
            DownloadTask {
                future: future.clone(),
                ref_count: 1,
            },
        );
        Claim::Started(future)
    }

    /// Remove the task for `key` once its future has resolved
    pub async fn finish(&self, key: &str) -> Option<usize> {
        self.tasks
            .lock()
            .await
            .remove(key)
            .map(|task| task.ref_count)
    }

    pub async fn ref_count(&self, key: &str) -> Option<usize> {
        self.tasks.lock().await.get(key).map(|task| task.ref_count)
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }
}
