//! Metrics collection for Plume consumers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Consumer metrics collector
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub acks_sent: AtomicU64,
    pub redeliver_requests: AtomicU64,
    pub permits_granted: AtomicU64,
    pub duplicates_discarded: AtomicU64,
    pub connections_opened: AtomicU64,
    pub connection_failures: AtomicU64,
}

impl ConsumerMetrics {
    /// Record messages arriving from the broker
    pub fn record_received(&self, message_count: u64, byte_count: u64) {
        self.messages_received
            .fetch_add(message_count, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a submitted acknowledgment
    pub fn record_ack(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a redelivery request sent to the broker
    pub fn record_redeliver_request(&self) {
        self.redeliver_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record flow permits granted to the broker
    pub fn record_permits(&self, permits: u64) {
        self.permits_granted.fetch_add(permits, Ordering::Relaxed);
    }

    /// Record a duplicate entry discarded before delivery
    pub fn record_duplicate(&self) {
        self.duplicates_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed subscribe handshake
    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed connect or subscribe attempt
    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            redeliver_requests: self.redeliver_requests.load(Ordering::Relaxed),
            permits_granted: self.permits_granted.load(Ordering::Relaxed),
            duplicates_discarded: self.duplicates_discarded.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub bytes_received: u64,
    pub acks_sent: u64,
    pub redeliver_requests: u64,
    pub permits_granted: u64,
    pub duplicates_discarded: u64,
    pub connections_opened: u64,
    pub connection_failures: u64,
}

/// Global metrics instance
static GLOBAL_METRICS: once_cell::sync::Lazy<Arc<ConsumerMetrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(ConsumerMetrics::default()));

/// Get the global metrics instance
pub fn global_metrics() -> Arc<ConsumerMetrics> {
    GLOBAL_METRICS.clone()
}
