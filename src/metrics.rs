//! Prometheus metrics for the tiered cache.
//!
//! Each coordinator owns its own [`Registry`] so several caches (and tests)
//! can live in one process without clashing on global registration.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct CacheMetrics {
    registry: Registry,

    /// Backend operations by tier, operation (get, set, delete) and outcome.
    pub tier_ops: IntCounterVec,

    /// Coordinator-level lookups by outcome (hit, miss, error).
    pub lookups: IntCounterVec,

    /// Backfill writes by target tier and outcome.
    pub backfills: IntCounterVec,

    /// Fan-out deletes by source tier and outcome.
    pub invalidations: IntCounterVec,

    /// Standing invalidation subscriptions.
    pub subscriptions: IntGauge,
}

impl CacheMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let tier_ops = IntCounterVec::new(
            Opts::new(
                "tiered_cache_tier_operations_total",
                "Backend operations by tier, operation and outcome",
            ),
            &["tier", "operation", "outcome"],
        )
        .expect("valid metric definition");

        let lookups = IntCounterVec::new(
            Opts::new("tiered_cache_lookups_total", "Cache lookups by outcome"),
            &["outcome"],
        )
        .expect("valid metric definition");

        let backfills = IntCounterVec::new(
            Opts::new(
                "tiered_cache_backfills_total",
                "Read-through promotions by target tier and outcome",
            ),
            &["tier", "outcome"],
        )
        .expect("valid metric definition");

        let invalidations = IntCounterVec::new(
            Opts::new(
                "tiered_cache_invalidations_total",
                "Fan-out invalidation deletes by source tier and outcome",
            ),
            &["source", "outcome"],
        )
        .expect("valid metric definition");

        let subscriptions = IntGauge::new(
            "tiered_cache_invalidation_subscriptions",
            "Active invalidation subscriptions",
        )
        .expect("valid metric definition");

        for collector in [
            Box::new(tier_ops.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(lookups.clone()),
            Box::new(backfills.clone()),
            Box::new(invalidations.clone()),
            Box::new(subscriptions.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric registered once per registry");
        }

        Self {
            registry,
            tier_ops,
            lookups,
            backfills,
            invalidations,
            subscriptions,
        }
    }

    pub fn record_op(&self, tier: &str, operation: &str, ok: bool) {
        self.tier_ops
            .with_label_values(&[tier, operation, outcome(ok)])
            .inc();
    }

    /// Render all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn outcome(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_recorded_ops() {
        let metrics = CacheMetrics::new();
        metrics.record_op("memory", "get", true);
        metrics.lookups.with_label_values(&["hit"]).inc();

        let text = metrics.encode().unwrap();
        assert!(text.contains("tiered_cache_tier_operations_total"));
        assert!(text.contains("tier=\"memory\""));
        assert!(text.contains("tiered_cache_lookups_total{outcome=\"hit\"} 1"));
    }

    #[test]
    fn test_independent_registries() {
        let a = CacheMetrics::new();
        let b = CacheMetrics::new();
        a.lookups.with_label_values(&["miss"]).inc();
        assert_eq!(b.lookups.with_label_values(&["miss"]).get(), 0);
    }
}
