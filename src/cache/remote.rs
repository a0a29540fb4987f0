//! Shared remote tier.
//!
//! [`RemoteStore`] adapts any [`RemoteClient`] to the backend contract. The
//! client owns the wire protocol; the store only maps misses, starts the
//! client's invalidation listener and hands it out as the tier's feed.
//! Once closed, the store answers every call with [`BackendError::Closed`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use crate::cache::backend::{CacheBackend, InvalidationFeed};
use crate::error::BackendError;

/// Narrow capability set of a remote cache service.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// A zero `ttl` stores the value without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError>;

    async fn del(&self, key: &str) -> Result<(), BackendError>;

    async fn close(&self) -> Result<(), BackendError>;

    /// Start delivering keys changed by other clients.
    async fn start_invalidation_listener(&self) -> Result<mpsc::Receiver<String>, BackendError>;
}

pub struct RemoteStore<C> {
    name: String,
    client: C,
    feed: Mutex<Option<mpsc::Receiver<String>>>,
    closed: AtomicBool,
}

impl<C: RemoteClient> RemoteStore<C> {
    pub async fn new(client: C) -> Result<Self, BackendError> {
        Self::with_name("remote", client).await
    }

    pub async fn with_name(name: impl Into<String>, client: C) -> Result<Self, BackendError> {
        let name = name.into();
        let feed = client
            .start_invalidation_listener()
            .await
            .map_err(|e| BackendError::Listener(e.to_string()))?;

        info!(store = %name, "Remote store ready");

        Ok(Self {
            name,
            client,
            feed: Mutex::new(Some(feed)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<C: RemoteClient> CacheBackend<String> for RemoteStore<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.ensure_open()?;
        self.client.get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), BackendError> {
        self.ensure_open()?;
        self.client.set(key, &value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.ensure_open()?;
        self.client.del(key).await
    }

    async fn close(&self) -> Result<(), BackendError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }
        self.client.close().await
    }

    fn invalidation_feed(&self) -> Option<InvalidationFeed> {
        self.feed.lock().take().map(InvalidationFeed::from_receiver)
    }
}
