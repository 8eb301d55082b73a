//! Per-transport health metrics
//!
//! The selector scores transports from this table alone; it holds no
//! references into drivers. `record_success` and `record_failure` are
//! the only mutation paths for reliability.

use chrono::Utc;
use dashmap::DashMap;

use reach_core::TransportKind;

/// Health metrics for one transport
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMetrics {
    /// Driver currently reports itself usable
    pub available: bool,
    /// Administratively enabled
    pub enabled: bool,
    /// Connected peers reachable through this transport
    pub device_count: usize,
    /// Estimated round-trip latency, milliseconds
    pub latency_hint: u32,
    /// Rolling success score, 0-100
    pub reliability: u8,
    /// Last successful emission, unix millis
    pub last_success: Option<i64>,
    /// Consecutive failures since the last success
    pub failure_count: u32,
}

impl TransportMetrics {
    fn fresh(kind: TransportKind) -> Self {
        Self {
            available: false,
            enabled: true,
            device_count: 0,
            latency_hint: kind.default_latency_hint(),
            reliability: 50,
            last_success: None,
            failure_count: 0,
        }
    }
}

/// The shared metrics table
#[derive(Default)]
pub struct MetricsTable {
    metrics: DashMap<TransportKind, TransportMetrics>,
}

impl MetricsTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure a transport has an entry
    pub fn register(&self, kind: TransportKind) {
        self.metrics
            .entry(kind)
            .or_insert_with(|| TransportMetrics::fresh(kind));
    }

    /// A send on this transport worked
    pub fn record_success(&self, kind: TransportKind) {
        let mut entry = self
            .metrics
            .entry(kind)
            .or_insert_with(|| TransportMetrics::fresh(kind));
        entry.reliability = entry.reliability.saturating_add(5).min(100);
        entry.last_success = Some(Utc::now().timestamp_millis());
        entry.failure_count = 0;
    }

    /// A send on this transport failed
    pub fn record_failure(&self, kind: TransportKind) {
        let mut entry = self
            .metrics
            .entry(kind)
            .or_insert_with(|| TransportMetrics::fresh(kind));
        entry.reliability = entry.reliability.saturating_sub(10);
        entry.failure_count += 1;
    }

    /// Driver availability flipped
    pub fn set_available(&self, kind: TransportKind, available: bool) {
        let mut entry = self
            .metrics
            .entry(kind)
            .or_insert_with(|| TransportMetrics::fresh(kind));
        entry.available = available;
    }

    /// Administrative enable/disable
    pub fn set_enabled(&self, kind: TransportKind, enabled: bool) {
        let mut entry = self
            .metrics
            .entry(kind)
            .or_insert_with(|| TransportMetrics::fresh(kind));
        entry.enabled = enabled;
    }

    /// Refresh the connected-peer count
    pub fn set_device_count(&self, kind: TransportKind, count: usize) {
        let mut entry = self
            .metrics
            .entry(kind)
            .or_insert_with(|| TransportMetrics::fresh(kind));
        entry.device_count = count;
    }

    /// Refresh the latency estimate
    pub fn set_latency_hint(&self, kind: TransportKind, latency_ms: u32) {
        let mut entry = self
            .metrics
            .entry(kind)
            .or_insert_with(|| TransportMetrics::fresh(kind));
        entry.latency_hint = latency_ms;
    }

    /// One transport's metrics
    pub fn get(&self, kind: TransportKind) -> Option<TransportMetrics> {
        self.metrics.get(&kind).map(|m| m.clone())
    }

    /// All registered transports with their metrics
    pub fn snapshot(&self) -> Vec<(TransportKind, TransportMetrics)> {
        self.metrics.iter().map(|e| (*e.key(), e.clone())).collect()
    }

    /// Transports currently usable
    pub fn available_kinds(&self) -> Vec<TransportKind> {
        self.metrics
            .iter()
            .filter(|e| e.available && e.enabled)
            .map(|e| *e.key())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliability_walk() {
        let table = MetricsTable::new();
        table.register(TransportKind::Local);
        assert_eq!(table.get(TransportKind::Local).unwrap().reliability, 50);

        for _ in 0..20 {
            table.record_success(TransportKind::Local);
        }
        // Capped at 100
        assert_eq!(table.get(TransportKind::Local).unwrap().reliability, 100);

        for _ in 0..20 {
            table.record_failure(TransportKind::Local);
        }
        // Floored at 0
        assert_eq!(table.get(TransportKind::Local).unwrap().reliability, 0);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let table = MetricsTable::new();
        table.record_failure(TransportKind::Internet);
        table.record_failure(TransportKind::Internet);
        assert_eq!(table.get(TransportKind::Internet).unwrap().failure_count, 2);

        table.record_success(TransportKind::Internet);
        let metrics = table.get(TransportKind::Internet).unwrap();
        assert_eq!(metrics.failure_count, 0);
        assert!(metrics.last_success.is_some());
    }

    #[test]
    fn test_availability_filter() {
        let table = MetricsTable::new();
        table.register(TransportKind::Local);
        table.register(TransportKind::Internet);
        assert!(table.available_kinds().is_empty());

        table.set_available(TransportKind::Local, true);
        assert_eq!(table.available_kinds(), vec![TransportKind::Local]);

        table.set_enabled(TransportKind::Local, false);
        assert!(table.available_kinds().is_empty());
    }
}
