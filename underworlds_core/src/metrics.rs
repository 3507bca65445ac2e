//! Server Metrics Module
//! =====================
//!
//! Lock-free counters describing invalidation traffic:
//! - **Published**: change records handed to the bus
//! - **Deliveries**: records accepted by a subscriber's link
//! - **Failures / Evictions**: timed-out or broken links and the sessions they cost
//!
//! Snapshots are serializable so tools can export them alongside the topology.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, shared between the server, the bus and its delivery workers.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    records_published: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
    evictions: AtomicU64,
    handshakes: AtomicU64,
    mutations: AtomicU64,
}

/// Point-in-time copy of `ServerMetrics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub records_published: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    pub evictions: u64,
    pub handshakes: u64,
    pub mutations: u64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self) {
        self.records_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake(&self) {
        self.handshakes.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one committed node or situation transition.
    pub fn record_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_published: self.records_published.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            handshakes: self.handshakes.load(Ordering::Relaxed),
            mutations: self.mutations.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Fraction of delivery attempts that failed, in [0, 1].
    pub fn failure_rate(&self) -> f64 {
        let attempts = self.deliveries + self.delivery_failures;
        if attempts == 0 {
            0.0
        } else {
            self.delivery_failures as f64 / attempts as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_counters_accumulate() {
        let metrics = ServerMetrics::new();
        metrics.record_published();
        metrics.record_delivery();
        metrics.record_delivery();
        metrics.record_delivery();
        metrics.record_failure();
        metrics.record_eviction();

        let snap = metrics.snapshot();
        assert_eq!(snap.records_published, 1);
        assert_eq!(snap.deliveries, 3);
        assert_eq!(snap.evictions, 1);
        assert_relative_eq!(snap.failure_rate(), 0.25);
    }

    #[test]
    fn test_empty_failure_rate() {
        assert_relative_eq!(MetricsSnapshot::default().failure_rate(), 0.0);
    }
}
