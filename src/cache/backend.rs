//! The backend contract every tier implements.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::BackendError;

/// A store that can occupy one tier of a [`TieredCache`](crate::cache::tiered::TieredCache).
///
/// `get` returns `Ok(None)` on a miss; `Err` is reserved for the backend
/// failing to answer at all.
#[async_trait]
pub trait CacheBackend<V>: Send + Sync {
    /// Short label used in logs, metrics and error messages.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<V>, BackendError>;

    async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<(), BackendError>;

    /// Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    async fn close(&self) -> Result<(), BackendError>;

    /// Keys changed out-of-band, if this backend can observe them.
    ///
    /// The feed is handed out once; later calls return `None`.
    fn invalidation_feed(&self) -> Option<InvalidationFeed> {
        None
    }
}

/// Unordered stream of invalidated keys coming from one backend.
pub struct InvalidationFeed {
    inner: BoxStream<'static, String>,
}

impl InvalidationFeed {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = String> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    pub fn from_receiver(rx: mpsc::Receiver<String>) -> Self {
        Self::new(ReceiverStream::new(rx))
    }
}

impl Stream for InvalidationFeed {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl fmt::Debug for InvalidationFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationFeed").finish_non_exhaustive()
    }
}

/// Run a backend operation under its own deadline, independent of the caller.
pub(crate) async fn bounded<T, F>(limit: Duration, op: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(limit)),
    }
}
