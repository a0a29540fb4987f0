//! Error types shared by the backends and the tiered coordinator.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a single cache backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend is closed")]
    Closed,

    #[error("Background sweep was already shut down")]
    AlreadyShutDown,

    #[error("Remote store error: {0}")]
    Remote(String),

    #[error("Failed to start invalidation listener: {0}")]
    Listener(String),

    #[error("Invalidation message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Failure reported by the tiered coordinator.
///
/// `NotFound` and `Tier` are kept apart so a miss everywhere can be told
/// from a backend failure without inspecting messages.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Key {key:?} not found in any tier")]
    NotFound { key: String },

    #[error("Tier {tier} ({backend}) failed: {source}")]
    Tier {
        tier: usize,
        backend: String,
        #[source]
        source: BackendError,
    },

    #[error("Cache is closed")]
    Closed,
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound { .. })
    }

    /// Position of the tier that produced this error, if any.
    pub fn tier(&self) -> Option<usize> {
        match self {
            CacheError::Tier { tier, .. } => Some(*tier),
            _ => None,
        }
    }
}

/// Invalid configuration, detected once at construction or load time.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cleanup interval must be greater than zero")]
    InvalidCleanupInterval,

    #[error("max_entries must be -1 (unbounded) or a positive integer, got {0}")]
    InvalidMaxEntries(i64),

    #[error("Timeout {0} must be greater than zero")]
    InvalidTimeout(&'static str),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}
