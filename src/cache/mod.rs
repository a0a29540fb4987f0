//! Tiered cache management.
//!
//! This module contains the backends and the coordinator that chains them:
//! - [`backend`]: the `CacheBackend` contract and invalidation feeds
//! - [`memory`]: bounded in-process store with TTL and periodic sweep
//! - [`remote`]: adapter from a `RemoteClient` to a backend
//! - [`redis_client`]: Redis `RemoteClient` with pub/sub invalidation
//! - [`tiered`]: read-through / write-through coordinator
//! - [`invalidation`]: cross-tier invalidation fan-out

pub mod backend;
pub mod invalidation;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_client;
pub mod remote;
pub mod tiered;
