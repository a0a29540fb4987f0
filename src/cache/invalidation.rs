//! Invalidation fan-out: one standing task per tier that exposes a feed.
//!
//! Every key a tier reports is deleted from all *other* tiers. Deletes run
//! concurrently, each under its own timeout, and failures are only logged:
//! invalidation is best effort and never blocks the source.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::backend::{bounded, InvalidationFeed};
use crate::cache::tiered::TierSlot;
use crate::metrics::{outcome, CacheMetrics};

/// A running fan-out task for one source tier.
///
/// Revoking the subscription ends the task even if the upstream feed never
/// closes. Dropping it has the same effect.
pub struct Subscription {
    source: usize,
    cancel: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn source(&self) -> usize {
        self.source
    }

    pub fn revoke(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Revoke and wait for the task to exit.
    pub async fn join(mut self) {
        self.revoke();
        if let Err(e) = (&mut self.handle).await {
            warn!(source = self.source, "Invalidation task ended abnormally: {e}");
        }
    }
}

pub struct InvalidationRouter {
    subscriptions: Vec<Subscription>,
    metrics: Arc<CacheMetrics>,
}

impl InvalidationRouter {
    pub(crate) fn start<V>(
        tiers: Arc<[TierSlot<V>]>,
        timeout: Duration,
        metrics: Arc<CacheMetrics>,
    ) -> Self
    where
        V: Clone + Send + Sync + 'static,
    {
        let mut subscriptions = Vec::new();
        for slot in tiers.iter() {
            if let Some(feed) = slot.backend.invalidation_feed() {
                subscriptions.push(subscribe(
                    Arc::clone(&tiers),
                    slot.position,
                    feed,
                    timeout,
                    Arc::clone(&metrics),
                ));
            }
        }
        metrics.subscriptions.set(subscriptions.len() as i64);

        Self {
            subscriptions,
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Revoke every subscription and wait for all of them to exit.
    pub async fn shutdown(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.join().await;
        }
        self.metrics.subscriptions.set(0);
    }
}

fn subscribe<V>(
    tiers: Arc<[TierSlot<V>]>,
    source: usize,
    mut feed: InvalidationFeed,
    timeout: Duration,
    metrics: Arc<CacheMetrics>,
) -> Subscription
where
    V: Clone + Send + Sync + 'static,
{
    let (cancel, mut cancelled) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let source_name = tiers[source].backend.name().to_string();
        info!(source, backend = %source_name, "Invalidation subscription started");

        loop {
            let key = tokio::select! {
                _ = &mut cancelled => break,
                next = feed.next() => match next {
                    Some(key) => key,
                    None => break,
                },
            };
            fan_out(&tiers, source, &source_name, &key, timeout, &metrics).await;
        }

        info!(source, backend = %source_name, "Invalidation subscription ended");
    });

    Subscription {
        source,
        cancel: Some(cancel),
        handle,
    }
}

/// Delete `key` from every tier except `source`.
async fn fan_out<V>(
    tiers: &[TierSlot<V>],
    source: usize,
    source_name: &str,
    key: &str,
    timeout: Duration,
    metrics: &CacheMetrics,
) where
    V: Clone + Send + Sync + 'static,
{
    let deletes = tiers
        .iter()
        .filter(|slot| slot.position != source)
        .map(|slot| async move {
            let result = bounded(timeout, slot.backend.delete(key)).await;
            metrics
                .invalidations
                .with_label_values(&[source_name, outcome(result.is_ok())])
                .inc();
            if let Err(e) = result {
                debug!(key, source, target = slot.position, backend = slot.backend.name(), error = %e, "Invalidation delete failed");
            }
        });
    join_all(deletes).await;

    debug!(key, source, "Invalidation fanned out");
}
