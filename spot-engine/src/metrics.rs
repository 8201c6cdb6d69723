//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the engine.
//!
//! # Metrics
//!
//! - `spot_holds_total` - Holds granted
//! - `spot_hold_rejections_total` - Holds refused (spot unavailable)
//! - `spot_confirmations_total` - Reservations moved to Active
//! - `spot_releases_total` - Reservations moved to Completed
//! - `spot_cancellations_total` - Holds withdrawn
//! - `spot_expirations_total` - Holds expired (inline or by the sweep)
//! - `spot_version_conflicts_total` - Conditional writes retried
//! - `spot_lock_timeouts_total` - Per-spot lock waits that gave up
//! - `spot_checkin_rejections_total` - Gate scans refused
//! - `spot_audit_dropped_total` - Audit records dropped on a full mailbox
//! - `spot_reminders_total` - Expiring-soon reminders sent
//! - `spot_notifications_dropped_total` - Holder notices dropped on a full mailbox
//! - `spot_geo_query_duration_seconds` - Radius query latency
//! - `spot_feed_flush_zones` - Zones republished per feed flush

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
///
/// Collectors are registered on a registry owned by this struct, so several
/// engines can live in one process (tests) without name clashes.
#[derive(Clone)]
pub struct Metrics {
    /// Holds granted
    pub holds_total: IntCounter,

    /// Holds refused
    pub hold_rejections_total: IntCounter,

    /// Check-ins confirmed
    pub confirmations_total: IntCounter,

    /// Check-outs
    pub releases_total: IntCounter,

    /// Holds cancelled
    pub cancellations_total: IntCounter,

    /// Holds expired
    pub expirations_total: IntCounter,

    /// Conditional writes retried after a conflict
    pub version_conflicts_total: IntCounter,

    /// Lock waits that timed out
    pub lock_timeouts_total: IntCounter,

    /// Gate scans refused
    pub checkin_rejections_total: IntCounter,

    /// Audit records dropped
    pub audit_dropped_total: IntCounter,

    /// Expiring-soon reminders
    pub reminders_total: IntCounter,

    /// Holder notices dropped
    pub notifications_dropped_total: IntCounter,

    /// Radius query latency
    pub geo_query_duration: Histogram,

    /// Zones per feed flush
    pub feed_flush_zones: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let holds_total = counter("spot_holds_total", "Holds granted")?;
        let hold_rejections_total =
            counter("spot_hold_rejections_total", "Holds refused because the spot was unavailable")?;
        let confirmations_total =
            counter("spot_confirmations_total", "Reservations moved to Active")?;
        let releases_total = counter("spot_releases_total", "Reservations moved to Completed")?;
        let cancellations_total = counter("spot_cancellations_total", "Holds withdrawn")?;
        let expirations_total = counter("spot_expirations_total", "Holds expired")?;
        let version_conflicts_total = counter(
            "spot_version_conflicts_total",
            "Conditional writes retried after a version conflict",
        )?;
        let lock_timeouts_total =
            counter("spot_lock_timeouts_total", "Per-spot lock waits that timed out")?;
        let checkin_rejections_total =
            counter("spot_checkin_rejections_total", "Gate scans refused")?;
        let audit_dropped_total = counter(
            "spot_audit_dropped_total",
            "Audit records dropped because the mailbox was full",
        )?;
        let reminders_total = counter("spot_reminders_total", "Expiring-soon reminders sent")?;
        let notifications_dropped_total = counter(
            "spot_notifications_dropped_total",
            "Holder notices dropped because the mailbox was full",
        )?;

        let geo_query_duration = Histogram::with_opts(
            HistogramOpts::new("spot_geo_query_duration_seconds", "Radius query latency")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100]),
        )?;
        registry.register(Box::new(geo_query_duration.clone()))?;

        let feed_flush_zones = Histogram::with_opts(
            HistogramOpts::new("spot_feed_flush_zones", "Zones republished per feed flush")
                .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0]),
        )?;
        registry.register(Box::new(feed_flush_zones.clone()))?;

        Ok(Self {
            holds_total,
            hold_rejections_total,
            confirmations_total,
            releases_total,
            cancellations_total,
            expirations_total,
            version_conflicts_total,
            lock_timeouts_total,
            checkin_rejections_total,
            audit_dropped_total,
            reminders_total,
            notifications_dropped_total,
            geo_query_duration,
            feed_flush_zones,
            registry,
        })
    }

    /// Record radius query latency
    pub fn record_geo_query(&self, duration_seconds: f64) {
        self.geo_query_duration.observe(duration_seconds);
    }

    /// Record feed flush
    pub fn record_feed_flush(&self, zones: usize) {
        self.feed_flush_zones.observe(zones as f64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.holds_total.get(), 0);
        assert_eq!(metrics.expirations_total.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();

        a.holds_total.inc();
        assert_eq!(a.holds_total.get(), 1);
        assert_eq!(b.holds_total.get(), 0);
    }

    #[test]
    fn test_render() {
        let metrics = Metrics::new().unwrap();
        metrics.confirmations_total.inc();
        metrics.record_geo_query(0.002);
        metrics.record_feed_flush(3);

        let text = metrics.render();
        assert!(text.contains("spot_confirmations_total 1"));
        assert!(text.contains("spot_geo_query_duration_seconds"));
    }
}
