//! HTTP front end for the tiered cache.
//!
//! - [`api`]: key/value routes, health, stats and Prometheus metrics

pub mod api;
