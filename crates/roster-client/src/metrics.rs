//! Prometheus metrics for discovery clients
//!
//! Provides metrics collection for:
//! - Watch events applied to service caches (counter)
//! - Records dropped because they failed to decode (counter)
//! - Connection rebuilds after a lost session (counter)
//! - Cached instances per service (gauge)
//!
//! Each client owns its own registry so several clients can live in one
//! process.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Prometheus metrics collector
pub struct DiscoveryMetrics {
    registry: Registry,

    /// Watch events applied, by service and event kind
    pub events_applied: IntCounterVec,

    /// Undecodable records skipped, by service
    pub decode_failures: IntCounterVec,

    /// Connection rebuilds triggered by session loss
    pub reconnects: IntCounter,

    /// Instances currently cached, by service
    pub cached_instances: IntGaugeVec,

    /// Service caches built, by service
    pub cache_builds: IntCounterVec,
}

impl DiscoveryMetrics {
    /// Create a metrics collector with a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_applied = IntCounterVec::new(
            Opts::new("roster_cache_events_applied_total", "Watch events applied to service caches"),
            &["service", "kind"],
        )?;
        registry.register(Box::new(events_applied.clone()))?;

        let decode_failures = IntCounterVec::new(
            Opts::new("roster_decode_failures_total", "Instance records skipped because they failed to decode"),
            &["service"],
        )?;
        registry.register(Box::new(decode_failures.clone()))?;

        let reconnects = IntCounter::new(
            "roster_reconnects_total",
            "Connection rebuilds after a lost session",
        )?;
        registry.register(Box::new(reconnects.clone()))?;

        let cached_instances = IntGaugeVec::new(
            Opts::new("roster_cached_instances", "Instances currently held by a service cache"),
            &["service"],
        )?;
        registry.register(Box::new(cached_instances.clone()))?;

        let cache_builds = IntCounterVec::new(
            Opts::new("roster_cache_builds_total", "Service caches built"),
            &["service"],
        )?;
        registry.register(Box::new(cache_builds.clone()))?;

        Ok(Self {
            registry,
            events_applied,
            decode_failures,
            reconnects,
            cached_instances,
            cache_builds,
        })
    }

    /// Record one applied watch event
    pub fn record_event(&self, service_name: &str, kind: &str) {
        self.events_applied
            .with_label_values(&[service_name, kind])
            .inc();
    }

    /// Record one record skipped as undecodable
    pub fn record_decode_failure(&self, service_name: &str) {
        self.decode_failures.with_label_values(&[service_name]).inc();
    }

    pub fn record_reconnect(&self) {
        self.reconnects.inc();
    }

    pub fn record_cache_build(&self, service_name: &str) {
        self.cache_builds.with_label_values(&[service_name]).inc();
    }

    /// Update the cached instance count of a service
    pub fn set_cached_instances(&self, service_name: &str, count: usize) {
        self.cached_instances
            .with_label_values(&[service_name])
            .set(count as i64);
    }

    /// Get metrics in Prometheus format
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
