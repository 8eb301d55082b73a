//! Transport selection
//!
//! Scores every available transport for a given peer and returns an
//! ordered attempt list: one primary plus up to two fallbacks. The
//! score mixes measured reliability, latency, recency of success, and
//! a static per-flavor bias.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::trace;

use reach_core::{NodeId, TransportKind};

use crate::metrics::MetricsTable;

/// Maximum attempts the selector hands back (primary + two fallbacks)
const MAX_ATTEMPTS: usize = 3;

/// Scores transports per peer from the shared metrics table
pub struct TransportSelector {
    metrics: Arc<MetricsTable>,
}

impl TransportSelector {
    /// Create a selector over a metrics table
    pub fn new(metrics: Arc<MetricsTable>) -> Self {
        Self { metrics }
    }

    /// The shared metrics table
    pub fn metrics(&self) -> &Arc<MetricsTable> {
        &self.metrics
    }

    /// Score one transport for a peer; None when unusable
    pub fn score(
        &self,
        kind: TransportKind,
        peer_transports: &HashSet<TransportKind>,
        now: i64,
    ) -> Option<i64> {
        let metrics = self.metrics.get(kind)?;
        if !metrics.available || !metrics.enabled {
            return None;
        }

        let mut score = metrics.reliability as i64;
        score += (50 - metrics.latency_hint as i64 / 10).max(0);
        if peer_transports.contains(&kind) {
            score += 50;
        }
        if let Some(last) = metrics.last_success {
            let since = now - last;
            if since < 60_000 {
                score += 30;
            }
            if since < 300_000 {
                score += 15;
            }
        }
        score -= 10 * metrics.failure_count as i64;
        score += (2 * metrics.device_count as i64).min(20);
        score += kind.bias() as i64;

        Some(score)
    }

    /// Ordered attempt list for a peer: best first, at most three
    pub fn select(&self, peer: &NodeId, peer_transports: &HashSet<TransportKind>) -> Vec<TransportKind> {
        let now = Utc::now().timestamp_millis();
        let mut scored: Vec<(i64, TransportKind)> = self
            .metrics
            .snapshot()
            .into_iter()
            .filter_map(|(kind, _)| self.score(kind, peer_transports, now).map(|s| (s, kind)))
            .collect();

        // Bias as a tie-break keeps the order deterministic
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.bias().cmp(&a.1.bias())));
        scored.truncate(MAX_ATTEMPTS);

        let order: Vec<TransportKind> = scored.into_iter().map(|(_, kind)| kind).collect();
        trace!(peer = %peer, ?order, "Transport attempt order");
        order
    }
}
