//! Runtime configuration for tiered-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All tier-related knobs (TTLs, capacity bounds, sweep and fan-out timings) live here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::cache::tiered::{BackfillMode, CoordinatorOptions};
use crate::error::ConfigError;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "tiered-cache", about = "Tiered cache coordinator server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides `server.listen`).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// In-process tier (always tier 0).
    pub memory: MemoryTierConfig,

    /// Shared remote tier (optional, tier 1 when present).
    pub remote: Option<RemoteTierConfig>,

    /// Coordinator policy.
    pub coordinator: CoordinatorConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// In-process tier settings as they appear in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryTierConfig {
    /// TTL applied to entries written into this tier.
    pub ttl_secs: u64,

    /// Period of the background expiry sweep.
    pub cleanup_interval_secs: u64,

    /// Maximum number of entries (-1 = unbounded).
    pub max_entries: i64,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            cleanup_interval_secs: 300,
            max_entries: -1,
        }
    }
}

impl MemoryTierConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn store_config(&self) -> MemoryStoreConfig {
        MemoryStoreConfig {
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            max_entries: self.max_entries,
        }
    }
}

/// Remote tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteTierConfig {
    /// Connection URL (e.g. "redis://127.0.0.1:6379").
    pub url: String,

    /// TTL applied to entries written into this tier (0 = no expiry).
    pub ttl_secs: u64,

    /// Pub/sub channel carrying invalidated keys between instances.
    pub invalidation_channel: String,
}

impl Default for RemoteTierConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            ttl_secs: 600,
            invalidation_channel: DEFAULT_INVALIDATION_CHANNEL.to_string(),
        }
    }
}

impl RemoteTierConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

pub const DEFAULT_INVALIDATION_CHANNEL: &str = "tiered-cache:invalidate";

/// Coordinator policy as it appears in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Whether read-through promotion runs detached or inline.
    pub backfill: BackfillMode,

    /// Per-tier bound on a single backfill write.
    pub backfill_timeout_ms: u64,

    /// Per-tier bound on a single fan-out delete.
    pub invalidation_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let defaults = CoordinatorOptions::default();
        Self {
            backfill: defaults.backfill,
            backfill_timeout_ms: defaults.backfill_timeout.as_millis() as u64,
            invalidation_timeout_ms: defaults.invalidation_timeout.as_millis() as u64,
        }
    }
}

impl CoordinatorConfig {
    pub fn options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            backfill: self.backfill,
            backfill_timeout: Duration::from_millis(self.backfill_timeout_ms),
            invalidation_timeout: Duration::from_millis(self.invalidation_timeout_ms),
        }
    }
}

/// Validated settings for a [`MemoryStore`](crate::cache::memory::MemoryStore).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStoreConfig {
    /// Period of the background expiry sweep (must be > 0).
    pub cleanup_interval: Duration,

    /// Capacity bound: -1 disables it, otherwise a positive entry count.
    pub max_entries: i64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(5 * 60),
            max_entries: -1,
        }
    }
}

impl MemoryStoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::InvalidCleanupInterval);
        }
        if self.max_entries == 0 || self.max_entries < -1 {
            return Err(ConfigError::InvalidMaxEntries(self.max_entries));
        }
        Ok(())
    }

    /// The capacity bound, or `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        usize::try_from(self.max_entries).ok().filter(|n| *n > 0)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.memory.store_config().validate()?;
        if self.coordinator.backfill_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("backfill_timeout_ms"));
        }
        if self.coordinator.invalidation_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("invalidation_timeout_ms"));
        }
        Ok(())
    }
}
