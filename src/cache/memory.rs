//! Bounded in-process store with per-entry TTL and a periodic sweep.
//!
//! Entries live in a primary map; a second index orders them by insertion
//! (an ever-increasing sequence number). Both structures sit behind a single
//! lock and are only touched through [`StoreState`], so a key is in the map
//! iff it has exactly one age record.
//!
//! Capacity eviction is FIFO by creation time. Replacing a key gives it a
//! fresh age record, so rewrites move a key to the back of the queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::cache::backend::CacheBackend;
use crate::config::MemoryStoreConfig;
use crate::error::{BackendError, ConfigError};

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries removed because their TTL had passed.
    pub expired: usize,
    /// Entries removed to get back under the capacity bound.
    pub evicted: usize,
}

/// Monitoring snapshot of a [`MemoryStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStoreStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evicted: u64,
    pub sweeps: u64,
}

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
    /// Key of this entry's record in the age index.
    seq: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

struct AgeRecord {
    key: String,
    created_at: Instant,
}

struct StoreState<V> {
    entries: HashMap<String, Entry<V>>,
    ages: BTreeMap<u64, AgeRecord>,
    next_seq: u64,
    capacity: Option<usize>,
    stats: MemoryStoreStats,
}

impl<V: Clone> StoreState<V> {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            entries: HashMap::new(),
            ages: BTreeMap::new(),
            next_seq: 0,
            capacity,
            stats: MemoryStoreStats::default(),
        }
    }

    fn get(&mut self, key: &str, now: Instant) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                self.stats.misses += 1;
                return None;
            }
        };

        if expired {
            self.remove(key);
            self.stats.expired += 1;
            self.stats.misses += 1;
            return None;
        }

        self.stats.hits += 1;
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Insert or replace `key`. Returns the key evicted to make room, if any.
    fn insert(&mut self, key: String, value: V, ttl: Duration, now: Instant) -> Option<String> {
        let mut evicted = None;

        if let Some(previous) = self.entries.remove(&key) {
            self.ages.remove(&previous.seq);
        } else if let Some(capacity) = self.capacity {
            if self.entries.len() >= capacity {
                evicted = self.evict_oldest(now);
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        // Zero TTL (or one too large to represent) never expires.
        let expires_at = if ttl.is_zero() {
            None
        } else {
            now.checked_add(ttl)
        };

        self.ages.insert(
            seq,
            AgeRecord {
                key: key.clone(),
                created_at: now,
            },
        );
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at,
                seq,
            },
        );

        evicted
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.ages.remove(&entry.seq);
                true
            }
            None => false,
        }
    }

    fn evict_oldest(&mut self, now: Instant) -> Option<String> {
        let (_, record) = self.ages.pop_first()?;
        self.entries.remove(&record.key);
        self.stats.evicted += 1;
        debug!(
            key = %record.key,
            age_ms = now.saturating_duration_since(record.created_at).as_millis() as u64,
            "Evicted oldest entry"
        );
        Some(record.key)
    }

    fn sweep(&mut self, now: Instant) -> SweepReport {
        let expired_keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired_keys {
            self.remove(key);
        }

        // Inserts keep the bound; this only corrects drift.
        let mut evicted = 0;
        if let Some(capacity) = self.capacity {
            while self.entries.len() > capacity {
                if self.evict_oldest(now).is_none() {
                    break;
                }
                evicted += 1;
            }
        }

        self.stats.expired += expired_keys.len() as u64;
        self.stats.sweeps += 1;

        SweepReport {
            expired: expired_keys.len(),
            evicted,
        }
    }

    fn snapshot(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            entries: self.entries.len(),
            ..self.stats.clone()
        }
    }

    #[cfg(test)]
    fn index_in_lockstep(&self) -> bool {
        self.entries.len() == self.ages.len()
            && self
                .ages
                .iter()
                .all(|(seq, record)| self.entries.get(&record.key).map(|e| e.seq) == Some(*seq))
    }
}

/// Handle on the background sweep task.
struct Sweeper {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    fn spawn<V>(state: Weak<Mutex<StoreState<V>>>, period: Duration, store: String) -> Self
    where
        V: Clone + Send + Sync + 'static,
    {
        let (stop, mut stop_rx) = oneshot::channel();
        let start = Instant::now() + period;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // The store was dropped without a shutdown.
                        let Some(state) = state.upgrade() else { break };
                        let report = state.lock().sweep(Instant::now());
                        if report.expired > 0 || report.evicted > 0 {
                            debug!(
                                store = %store,
                                expired = report.expired,
                                evicted = report.evicted,
                                "Sweep complete"
                            );
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });

        Self { stop, handle }
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            error!("Sweep task ended abnormally: {e}");
        }
    }
}

/// In-process tier: a TTL map with an optional entry bound.
///
/// Construction spawns the sweep task, so it must happen inside a Tokio
/// runtime.
pub struct MemoryStore<V> {
    name: String,
    state: Arc<Mutex<StoreState<V>>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<V> MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: MemoryStoreConfig) -> Result<Self, ConfigError> {
        Self::with_name("memory", config)
    }

    pub fn with_name(name: impl Into<String>, config: MemoryStoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let name = name.into();

        let state = Arc::new(Mutex::new(StoreState::new(config.capacity())));
        let sweeper = Sweeper::spawn(Arc::downgrade(&state), config.cleanup_interval, name.clone());

        info!(
            store = %name,
            cleanup_interval_ms = config.cleanup_interval.as_millis() as u64,
            max_entries = config.max_entries,
            "Memory store started"
        );

        Ok(Self {
            name,
            state,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Run one sweep pass now, independent of the background schedule.
    pub fn sweep(&self) -> SweepReport {
        self.state.lock().sweep(Instant::now())
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MemoryStoreStats {
        self.state.lock().snapshot()
    }

    /// Stop the background sweep and wait for it to exit.
    ///
    /// May be called once. A second call is a caller bug and is reported
    /// as [`BackendError::AlreadyShutDown`].
    pub async fn shutdown(&self) -> Result<(), BackendError> {
        let sweeper = self.sweeper.lock().take();
        match sweeper {
            Some(sweeper) => {
                sweeper.stop().await;
                info!(store = %self.name, "Memory store sweep stopped");
                Ok(())
            }
            None => {
                error!(store = %self.name, "Sweep shutdown invoked more than once");
                Err(BackendError::AlreadyShutDown)
            }
        }
    }
}

#[async_trait]
impl<V> CacheBackend<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<V>, BackendError> {
        Ok(self.state.lock().get(key, Instant::now()))
    }

    async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<(), BackendError> {
        let evicted = self
            .state
            .lock()
            .insert(key.to_string(), value, ttl, Instant::now());
        if let Some(evicted) = evicted {
            debug!(store = %self.name, key, evicted = %evicted, "Made room at capacity");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.state.lock().remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounded(max_entries: i64) -> MemoryStoreConfig {
        MemoryStoreConfig {
            max_entries,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryStore::<String>::new(MemoryStoreConfig::default()).unwrap();
        store.set("test", "value".into(), Duration::from_secs(60)).await.unwrap();

        let value = store.get("test").await.unwrap();
        assert_eq!(value.as_deref(), Some("value"));
        assert_eq!(store.get("nonexistent").await.unwrap(), None);

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::<String>::new(MemoryStoreConfig::default()).unwrap();
        store.set("test", "value".into(), Duration::from_secs(60)).await.unwrap();

        store.delete("test").await.unwrap();
        assert_eq!(store.get("test").await.unwrap(), None);

        // Absent key is a no-op.
        store.delete("test").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_boundary() {
        let store = MemoryStore::<String>::new(MemoryStoreConfig::default()).unwrap();
        store.set("k", "v".into(), Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(store.get("k").await.unwrap(), None);

        // Lazy expiry also dropped the age record.
        assert!(store.is_empty());
        assert!(store.state.lock().index_in_lockstep());
        assert_eq!(store.stats().expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_expires() {
        let store = MemoryStore::<String>::new(MemoryStoreConfig::default()).unwrap();
        store.set("k", "v".into(), Duration::ZERO).await.unwrap();

        tokio::time::advance(Duration::from_secs(24 * 3600)).await;
        assert_eq!(store.sweep(), SweepReport::default());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let store = MemoryStore::<String>::new(bounded(2)).unwrap();
        let ttl = Duration::from_secs(60);

        store.set("a", "1".into(), ttl).await.unwrap();
        store.set("b", "2".into(), ttl).await.unwrap();
        store.set("c", "3".into(), ttl).await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.get("c").await.unwrap().as_deref(), Some("3"));
        assert_eq!(store.len(), 2);
        assert_eq!(store.stats().evicted, 1);
    }

    #[tokio::test]
    async fn test_replace_resets_age() {
        let store = MemoryStore::<String>::new(bounded(2)).unwrap();
        let ttl = Duration::from_secs(60);

        store.set("a", "1".into(), ttl).await.unwrap();
        store.set("b", "2".into(), ttl).await.unwrap();
        // Rewriting "a" makes "b" the oldest.
        store.set("a", "1b".into(), ttl).await.unwrap();
        store.set("c", "3".into(), ttl).await.unwrap();

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1b"));
        assert_eq!(store.get("b").await.unwrap(), None);
        assert_eq!(store.get("c").await.unwrap().as_deref(), Some("3"));
        assert!(store.state.lock().index_in_lockstep());
    }

    #[tokio::test]
    async fn test_replace_at_capacity_does_not_evict() {
        let store = MemoryStore::<String>::new(bounded(2)).unwrap();
        let ttl = Duration::from_secs(60);

        store.set("a", "1".into(), ttl).await.unwrap();
        store.set("b", "2".into(), ttl).await.unwrap();
        store.set("b", "2b".into(), ttl).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.stats().evicted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired() {
        let store = MemoryStore::<String>::new(MemoryStoreConfig::default()).unwrap();
        store.set("short", "1".into(), Duration::from_secs(1)).await.unwrap();
        store.set("long", "2".into(), Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let report = store.sweep();

        assert_eq!(report, SweepReport { expired: 1, evicted: 0 });
        assert_eq!(store.len(), 1);
        assert!(store.state.lock().index_in_lockstep());
    }

    #[test]
    fn test_sweep_corrects_capacity_drift() {
        let now = Instant::now();
        let mut state = StoreState::<u32>::new(None);
        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            state.insert(key.to_string(), i as u32, Duration::from_secs(60), now);
        }

        // Simulate the bound being overshot.
        state.capacity = Some(2);
        let report = state.sweep(now);

        assert_eq!(report, SweepReport { expired: 0, evicted: 2 });
        assert!(state.entries.contains_key("c"));
        assert!(state.entries.contains_key("d"));
        assert!(state.index_in_lockstep());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_runs() {
        let config = MemoryStoreConfig {
            cleanup_interval: Duration::from_secs(1),
            max_entries: -1,
        };
        let store = MemoryStore::<String>::new(config).unwrap();
        store.set("short", "1".into(), Duration::from_millis(500)).await.unwrap();
        store.set("long", "2".into(), Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        tokio::task::yield_now().await;

        assert_eq!(store.len(), 1);
        assert!(store.stats().sweeps >= 1);
    }

    #[tokio::test]
    async fn test_double_shutdown_is_reported() {
        let store = MemoryStore::<String>::new(MemoryStoreConfig::default()).unwrap();
        store.shutdown().await.unwrap();
        assert!(matches!(
            store.shutdown().await,
            Err(BackendError::AlreadyShutDown)
        ));

        // The data path keeps working without the sweep.
        store.set("k", "v".into(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = MemoryStoreConfig {
            cleanup_interval: Duration::ZERO,
            max_entries: -1,
        };
        assert!(MemoryStore::<String>::new(config).is_err());
        assert!(MemoryStore::<String>::new(bounded(0)).is_err());
    }
}
