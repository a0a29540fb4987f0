//! Tiered coordinator: one read/write surface over an ordered chain of backends.
//!
//! - Reads walk the tiers in order and stop at the first hit, then promote
//!   the value into every faster tier (each at its own TTL).
//! - Writes and deletes are attempted on every tier; the last failure wins.
//! - Invalidation feeds are fanned out by the [`InvalidationRouter`].
//!
//! There is no cross-tier transaction. A backfill racing a write or an
//! invalidation on the same key resolves per tier, last writer wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::backend::{bounded, CacheBackend};
use crate::cache::invalidation::InvalidationRouter;
use crate::error::{BackendError, CacheError};
use crate::metrics::{outcome, CacheMetrics};

/// When read-through promotion runs relative to the `get` that found the value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackfillMode {
    /// Spawned as a tracked task; `get` returns as soon as the value is found.
    #[default]
    Detached,
    /// Awaited before `get` returns.
    Inline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub backfill: BackfillMode,

    /// Bound on each backfill write, independent of the caller.
    pub backfill_timeout: Duration,

    /// Bound on each fan-out delete.
    pub invalidation_timeout: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            backfill: BackfillMode::Detached,
            backfill_timeout: Duration::from_secs(5),
            invalidation_timeout: Duration::from_secs(5),
        }
    }
}

/// Construction input: a backend and the TTL used when writing into it.
pub struct Tier<V> {
    backend: Arc<dyn CacheBackend<V>>,
    ttl: Duration,
}

impl<V> Tier<V> {
    pub fn new<B>(backend: Arc<B>, ttl: Duration) -> Self
    where
        B: CacheBackend<V> + 'static,
    {
        Self { backend, ttl }
    }
}

/// A tier fixed at its position for the coordinator's lifetime.
pub(crate) struct TierSlot<V> {
    pub(crate) backend: Arc<dyn CacheBackend<V>>,
    pub(crate) ttl: Duration,
    pub(crate) position: usize,
}

/// Read-only description of a tier, for stats and health output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierInfo {
    pub position: usize,
    pub backend: String,
    pub ttl_secs: u64,
}

pub struct TieredCache<V> {
    tiers: Arc<[TierSlot<V>]>,
    options: CoordinatorOptions,
    metrics: Arc<CacheMetrics>,
    router: tokio::sync::Mutex<InvalidationRouter>,
    backfills: parking_lot::Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl<V> TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(tiers: Vec<Tier<V>>) -> Self {
        Self::with_options(tiers, CoordinatorOptions::default())
    }

    /// Build the coordinator and start one invalidation subscription per
    /// backend that exposes a feed. Must run inside a Tokio runtime when any
    /// backend does.
    pub fn with_options(tiers: Vec<Tier<V>>, options: CoordinatorOptions) -> Self {
        let tiers: Arc<[TierSlot<V>]> = tiers
            .into_iter()
            .enumerate()
            .map(|(position, tier)| TierSlot {
                backend: tier.backend,
                ttl: tier.ttl,
                position,
            })
            .collect();

        let metrics = Arc::new(CacheMetrics::new());
        let router = InvalidationRouter::start(
            Arc::clone(&tiers),
            options.invalidation_timeout,
            Arc::clone(&metrics),
        );

        info!(
            tiers = tiers.len(),
            subscriptions = router.len(),
            backfill = ?options.backfill,
            "Tiered cache ready"
        );

        Self {
            tiers,
            options,
            metrics,
            router: tokio::sync::Mutex::new(router),
            backfills: parking_lot::Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Look `key` up tier by tier.
    ///
    /// A failing tier does not stop the walk. With no hit anywhere, the last
    /// tier failure is returned if there was one, else [`CacheError::NotFound`].
    pub async fn get(&self, key: &str) -> Result<V, CacheError> {
        self.ensure_open()?;

        let mut last_err = None;
        for slot in self.tiers.iter() {
            let name = slot.backend.name();
            match slot.backend.get(key).await {
                Ok(Some(value)) => {
                    self.metrics.record_op(name, "get", true);
                    self.metrics.lookups.with_label_values(&["hit"]).inc();
                    debug!(key, tier = slot.position, backend = name, "Cache hit");

                    if slot.position > 0 {
                        self.backfill(key, &value, slot.position).await;
                    }
                    return Ok(value);
                }
                Ok(None) => {
                    self.metrics.record_op(name, "get", true);
                }
                Err(e) => {
                    self.metrics.record_op(name, "get", false);
                    warn!(key, tier = slot.position, backend = name, error = %e, "Tier lookup failed");
                    last_err = Some(tier_error(slot, e));
                }
            }
        }

        match last_err {
            Some(err) => {
                self.metrics.lookups.with_label_values(&["error"]).inc();
                Err(err)
            }
            None => {
                self.metrics.lookups.with_label_values(&["miss"]).inc();
                Err(CacheError::NotFound {
                    key: key.to_string(),
                })
            }
        }
    }

    /// Write `value` to every tier, each with its own TTL.
    ///
    /// Every tier is attempted; only the last failure is returned.
    pub async fn set(&self, key: &str, value: V) -> Result<(), CacheError> {
        self.ensure_open()?;

        let mut last_err = None;
        for slot in self.tiers.iter() {
            let result = slot.backend.set(key, value.clone(), slot.ttl).await;
            self.metrics.record_op(slot.backend.name(), "set", result.is_ok());
            if let Err(e) = result {
                warn!(key, tier = slot.position, backend = slot.backend.name(), error = %e, "Tier write failed");
                last_err = Some(tier_error(slot, e));
            }
        }

        last_err.map_or(Ok(()), Err)
    }

    /// Remove `key` from every tier, with the same semantics as [`set`](Self::set).
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.ensure_open()?;

        let mut last_err = None;
        for slot in self.tiers.iter() {
            let result = slot.backend.delete(key).await;
            self.metrics.record_op(slot.backend.name(), "delete", result.is_ok());
            if let Err(e) = result {
                warn!(key, tier = slot.position, backend = slot.backend.name(), error = %e, "Tier delete failed");
                last_err = Some(tier_error(slot, e));
            }
        }

        last_err.map_or(Ok(()), Err)
    }

    /// Stop invalidation subscriptions, wait for pending backfills, then
    /// close every backend. The coordinator cannot be reopened.
    pub async fn close(&self) -> Result<(), CacheError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }

        self.router.lock().await.shutdown().await;

        let mut backfills = std::mem::take(&mut *self.backfills.lock());
        while let Some(joined) = backfills.join_next().await {
            if let Err(e) = joined {
                warn!("Backfill task ended abnormally: {e}");
            }
        }

        let mut last_err = None;
        for slot in self.tiers.iter() {
            if let Err(e) = slot.backend.close().await {
                warn!(tier = slot.position, backend = slot.backend.name(), error = %e, "Tier close failed");
                last_err = Some(tier_error(slot, e));
            }
        }

        info!(tiers = self.tiers.len(), "Tiered cache closed");
        last_err.map_or(Ok(()), Err)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn tiers(&self) -> Vec<TierInfo> {
        self.tiers
            .iter()
            .map(|slot| TierInfo {
                position: slot.position,
                backend: slot.backend.name().to_string(),
                ttl_secs: slot.ttl.as_secs(),
            })
            .collect()
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Number of detached backfills not yet reaped.
    pub fn pending_backfills(&self) -> usize {
        self.backfills.lock().len()
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.is_closed() {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    async fn backfill(&self, key: &str, value: &V, hit: usize) {
        let task = promote(
            Arc::clone(&self.tiers),
            Arc::clone(&self.metrics),
            key.to_string(),
            value.clone(),
            hit,
            self.options.backfill_timeout,
        );

        match self.options.backfill {
            BackfillMode::Inline => task.await,
            BackfillMode::Detached => {
                let mut backfills = self.backfills.lock();
                while backfills.try_join_next().is_some() {}
                backfills.spawn(task);
            }
        }
    }
}

/// Write `value` into tiers `0..hit`, best effort.
async fn promote<V>(
    tiers: Arc<[TierSlot<V>]>,
    metrics: Arc<CacheMetrics>,
    key: String,
    value: V,
    hit: usize,
    timeout: Duration,
) where
    V: Clone + Send + Sync + 'static,
{
    let writes = tiers[..hit].iter().map(|slot| {
        let value = value.clone();
        let key = key.as_str();
        let metrics = &metrics;
        async move {
            let result = bounded(timeout, slot.backend.set(key, value, slot.ttl)).await;
            metrics
                .backfills
                .with_label_values(&[slot.backend.name(), outcome(result.is_ok())])
                .inc();
            if let Err(e) = result {
                debug!(key, tier = slot.position, backend = slot.backend.name(), error = %e, "Backfill failed");
            }
        }
    });
    join_all(writes).await;

    debug!(key = %key, from = hit, "Backfill complete");
}

fn tier_error<V>(slot: &TierSlot<V>, source: BackendError) -> CacheError {
    CacheError::Tier {
        tier: slot.position,
        backend: slot.backend.name().to_string(),
        source,
    }
}
