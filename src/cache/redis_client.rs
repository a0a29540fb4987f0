//! Redis implementation of [`RemoteClient`].
//!
//! Data commands go through a [`ConnectionManager`] (reconnects on its own).
//! Invalidation uses a pub/sub channel shared by every instance: each write
//! or delete publishes `{"origin", "key"}`, and the listener forwards keys
//! published by *other* origins only. A dropped subscription is re-established with
//! backoff; messages published while disconnected are not replayed.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::remote::RemoteClient;
use crate::error::BackendError;

/// Buffered keys between the pub/sub reader and the fan-out task.
const INVALIDATION_BUFFER: usize = 100;

const RECONNECT_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct InvalidationMessage {
    origin: String,
    key: String,
}

struct Listener {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct RedisClient {
    client: redis::Client,
    connection: ConnectionManager,
    channel: String,
    origin: String,
    listener: Mutex<Option<Listener>>,
}

impl RedisClient {
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, BackendError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client.clone()).await?;
        let origin = Uuid::new_v4().to_string();
        let channel = channel.into();

        info!(url, channel = %channel, origin = %origin, "Connected to Redis");

        Ok(Self {
            client,
            connection,
            channel,
            origin,
            listener: Mutex::new(None),
        })
    }

    async fn publish_invalidation(&self, key: &str) -> Result<(), BackendError> {
        let payload = encode_message(&self.origin, key)?;
        let mut conn = self.connection.clone();
        let _: () = conn.publish(&self.channel, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for RedisClient {
    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(millis) = expiry_millis(ttl) {
            cmd.arg("PX").arg(millis);
        }
        let _: () = cmd.query_async(&mut conn).await?;

        self.publish_invalidation(key).await
    }

    async fn del(&self, key: &str) -> Result<(), BackendError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await?;

        self.publish_invalidation(key).await
    }

    async fn close(&self) -> Result<(), BackendError> {
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            let _ = listener.stop.send(());
            if let Err(e) = listener.handle.await {
                warn!("Invalidation listener ended abnormally: {e}");
            }
        }
        info!(channel = %self.channel, "Redis client closed");
        Ok(())
    }

    async fn start_invalidation_listener(&self) -> Result<mpsc::Receiver<String>, BackendError> {
        if self.listener.lock().is_some() {
            return Err(BackendError::Listener("listener already running".into()));
        }

        // The first subscription is made here so an unreachable server
        // fails construction instead of the task.
        let initial = open_subscription(self.client.clone(), self.channel.clone()).await?;

        let (tx, rx) = mpsc::channel(INVALIDATION_BUFFER);
        let (stop, stop_rx) = oneshot::channel::<()>();
        let client = self.client.clone();
        let channel = self.channel.clone();
        let reopen = move || open_subscription(client.clone(), channel.clone());

        let handle = tokio::spawn(run_listener(
            reopen,
            self.channel.clone(),
            self.origin.clone(),
            initial,
            tx,
            stop_rx,
        ));

        *self.listener.lock() = Some(Listener { stop, handle });
        info!(channel = %self.channel, "Invalidation listener started");
        Ok(rx)
    }
}

/// Subscribe to `channel` and yield raw message payloads until the
/// connection drops.
async fn open_subscription(
    client: redis::Client,
    channel: String,
) -> Result<BoxStream<'static, String>, BackendError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(&channel).await?;

    let payloads = pubsub.into_on_message().filter_map(|msg| {
        let payload = match msg.get_payload::<String>() {
            Ok(payload) => Some(payload),
            Err(e) => {
                debug!(error = %e, "Unreadable invalidation payload");
                None
            }
        };
        future::ready(payload)
    });
    Ok(payloads.boxed())
}

enum ReadOutcome {
    /// Stop was requested or the feed's receiver is gone.
    Stopped,
    /// The server side of the subscription went away.
    Disconnected,
}

/// Listener task: read until disconnected, then resubscribe with backoff.
///
/// Exits only when stopped or when nobody holds the feed any more.
async fn run_listener<F, Fut>(
    reopen: F,
    channel: String,
    origin: String,
    initial: BoxStream<'static, String>,
    tx: mpsc::Sender<String>,
    mut stop_rx: oneshot::Receiver<()>,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<BoxStream<'static, String>, BackendError>>,
{
    let mut current = Some(initial);
    let mut backoff = RECONNECT_BACKOFF_MIN;

    loop {
        let payloads = match current.take() {
            Some(payloads) => payloads,
            None => {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }

                let reopened = tokio::select! {
                    _ = &mut stop_rx => break,
                    reopened = reopen() => reopened,
                };
                match reopened {
                    Ok(payloads) => {
                        warn!(channel = %channel, "Invalidation subscription re-established");
                        backoff = RECONNECT_BACKOFF_MIN;
                        payloads
                    }
                    Err(e) => {
                        warn!(channel = %channel, error = %e, retry_in_ms = backoff.as_millis() as u64, "Invalidation resubscribe failed");
                        backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                        continue;
                    }
                }
            }
        };

        match read_messages(payloads, &origin, &tx, &mut stop_rx).await {
            ReadOutcome::Stopped => break,
            ReadOutcome::Disconnected => {
                warn!(channel = %channel, retry_in_ms = backoff.as_millis() as u64, "Invalidation subscription lost, reconnecting");
            }
        }
    }

    debug!(channel = %channel, "Invalidation listener exited");
}

async fn read_messages(
    mut payloads: BoxStream<'static, String>,
    origin: &str,
    tx: &mpsc::Sender<String>,
    stop_rx: &mut oneshot::Receiver<()>,
) -> ReadOutcome {
    loop {
        let payload = tokio::select! {
            _ = &mut *stop_rx => return ReadOutcome::Stopped,
            payload = payloads.next() => match payload {
                Some(payload) => payload,
                None => return ReadOutcome::Disconnected,
            },
        };

        if let Some(key) = forwarded_key(origin, &payload) {
            if tx.send(key).await.is_err() {
                return ReadOutcome::Stopped;
            }
        }
    }
}

/// The key to forward for one pub/sub payload, if any.
///
/// Our own writes are dropped: the local tiers already hold the new state.
fn forwarded_key(origin: &str, payload: &str) -> Option<String> {
    match decode_message(payload) {
        Ok(message) if message.origin == origin => None,
        Ok(message) => Some(message.key),
        Err(e) => {
            debug!(error = %e, "Malformed invalidation message");
            None
        }
    }
}

/// `PX` argument for `ttl`, or `None` for no expiry.
///
/// Sub-millisecond TTLs round up to 1; huge ones saturate.
fn expiry_millis(ttl: Duration) -> Option<u64> {
    if ttl.is_zero() {
        return None;
    }
    Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1))
}

fn encode_message(origin: &str, key: &str) -> Result<String, BackendError> {
    Ok(serde_json::to_string(&InvalidationMessage {
        origin: origin.to_string(),
        key: key.to_string(),
    })?)
}

fn decode_message(payload: &str) -> Result<InvalidationMessage, BackendError> {
    Ok(serde_json::from_str(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures::stream;

    fn foreign(key: &str) -> String {
        encode_message("node-b", key).unwrap()
    }

    #[test]
    fn test_message_carries_origin_and_key() {
        let payload = encode_message("node-a", "user:42").unwrap();
        let message = decode_message(&payload).unwrap();
        assert_eq!(message.origin, "node-a");
        assert_eq!(message.key, "user:42");
    }

    #[test]
    fn test_expiry_millis() {
        assert_eq!(expiry_millis(Duration::ZERO), None);
        assert_eq!(expiry_millis(Duration::from_micros(10)), Some(1));
        assert_eq!(expiry_millis(Duration::from_secs(600)), Some(600_000));
        assert_eq!(expiry_millis(Duration::MAX), Some(u64::MAX));
    }

    #[test]
    fn test_own_writes_are_not_forwarded() {
        let payload = encode_message("node-a", "user:42").unwrap();
        assert_eq!(forwarded_key("node-a", &payload), None);
    }

    #[test]
    fn test_foreign_writes_are_forwarded() {
        let payload = encode_message("node-b", "user:42").unwrap();
        assert_eq!(forwarded_key("node-a", &payload).as_deref(), Some("user:42"));
    }

    #[test]
    fn test_malformed_payload_is_skipped() {
        assert_eq!(forwarded_key("node-a", "user:42"), None);
        assert_eq!(forwarded_key("node-a", r#"{"origin":"node-b"}"#), None);
    }

    #[test]
    fn test_malformed_message_is_codec_error() {
        assert!(matches!(
            decode_message("user:42"),
            Err(BackendError::Codec(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_resubscribes_after_disconnect() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let reopen = {
            let attempts = Arc::clone(&attempts);
            move || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(BackendError::Remote("connection refused".into()))
                    } else {
                        Ok(stream::iter(vec![foreign("after")])
                            .chain(stream::pending())
                            .boxed())
                    }
                }
            }
        };
        // The first subscription delivers two messages, then drops.
        let initial = stream::iter(vec![
            foreign("before"),
            encode_message("node-a", "own").unwrap(),
        ])
        .boxed();

        let (tx, mut rx) = mpsc::channel(8);
        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run_listener(
            reopen,
            "chan".to_string(),
            "node-a".to_string(),
            initial,
            tx,
            stop_rx,
        ));

        assert_eq!(rx.recv().await.as_deref(), Some("before"));
        assert_eq!(rx.recv().await.as_deref(), Some("after"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        stop.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_exits_when_feed_dropped_while_disconnected() {
        let reopen = || async {
            Err::<BoxStream<'static, String>, _>(BackendError::Remote("down".into()))
        };
        let (tx, rx) = mpsc::channel(8);
        let (_stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run_listener(
            reopen,
            "chan".to_string(),
            "node-a".to_string(),
            stream::empty().boxed(),
            tx,
            stop_rx,
        ));

        drop(rx);
        tokio::time::timeout(Duration::from_secs(120), handle)
            .await
            .expect("listener should stop once the feed is gone")
            .unwrap();
    }
}
