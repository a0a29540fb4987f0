//! tiered-cache: one read/write surface over an ordered chain of cache tiers.
//!
//! A fast bounded in-process store sits in front of a shared remote store:
//!   in-process (hot) → remote (shared)
//!
//! Reads promote values into faster tiers, writes and deletes reach every
//! tier, and invalidations observed by one tier are fanned out to the rest.

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod server;

pub use cache::backend::{CacheBackend, InvalidationFeed};
pub use cache::memory::{MemoryStore, MemoryStoreStats, SweepReport};
pub use cache::remote::{RemoteClient, RemoteStore};
pub use cache::tiered::{BackfillMode, CoordinatorOptions, Tier, TierInfo, TieredCache};
pub use config::MemoryStoreConfig;
pub use error::{BackendError, CacheError, ConfigError};
