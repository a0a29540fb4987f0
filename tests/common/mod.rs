//! Scriptable backend shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tiered_cache::{BackendError, CacheBackend, InvalidationFeed};

/// In-memory backend that records every call and can be told to fail.
#[derive(Default)]
pub struct MockBackend {
    name: String,
    pub data: Mutex<HashMap<String, (String, Duration)>>,
    pub deleted: Mutex<Vec<String>>,
    pub fail_get: AtomicBool,
    pub fail_set: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_close: AtomicBool,
    pub closes: AtomicUsize,
    feed: Mutex<Option<mpsc::Receiver<String>>>,
}

impl MockBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// A backend exposing an invalidation feed; the sender drives it.
    pub fn with_feed(name: &str) -> (Self, mpsc::Sender<String>) {
        let (tx, rx) = mpsc::channel(16);
        let backend = Self::new(name);
        *backend.feed.lock() = Some(rx);
        (backend, tx)
    }

    pub fn failing(name: &str) -> Self {
        let backend = Self::new(name);
        backend.fail_get.store(true, Ordering::SeqCst);
        backend.fail_set.store(true, Ordering::SeqCst);
        backend.fail_delete.store(true, Ordering::SeqCst);
        backend.fail_close.store(true, Ordering::SeqCst);
        backend
    }

    pub fn put(&self, key: &str, value: &str) {
        self.data
            .lock()
            .insert(key.to_string(), (value.to_string(), Duration::ZERO));
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.data.lock().get(key).map(|(v, _)| v.clone())
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.data.lock().get(key).map(|(_, ttl)| *ttl)
    }

    pub fn deleted_keys(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    fn check(&self, flag: &AtomicBool) -> Result<(), BackendError> {
        if flag.load(Ordering::SeqCst) {
            Err(BackendError::Remote(format!("{} unavailable", self.name)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheBackend<String> for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.check(&self.fail_get)?;
        Ok(self.value(key))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), BackendError> {
        self.check(&self.fail_set)?;
        self.data.lock().insert(key.to_string(), (value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.deleted.lock().push(key.to_string());
        self.check(&self.fail_delete)?;
        self.data.lock().remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.check(&self.fail_close)
    }

    fn invalidation_feed(&self) -> Option<InvalidationFeed> {
        self.feed.lock().take().map(InvalidationFeed::from_receiver)
    }
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
