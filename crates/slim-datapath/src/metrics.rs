//! Message processor counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use slim_transport::MetricsSnapshot;

/// Point-in-time copy of the processor counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatapathMetricsSnapshot {
    /// Messages sent on to another connection.
    pub messages_forwarded: u64,
    /// Messages handed to the local endpoint.
    pub messages_delivered_local: u64,
    /// Messages with no route, undecodable or refused locally.
    pub messages_dropped: u64,
    /// Transport counters at the same moment.
    pub transport: MetricsSnapshot,
}

/// Lock-free processor counters.
#[derive(Debug, Default)]
pub struct DatapathMetrics {
    messages_forwarded: AtomicU64,
    messages_delivered_local: AtomicU64,
    messages_dropped: AtomicU64,
}

impl DatapathMetrics {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one forwarded message.
    pub fn inc_forwarded(&self) {
        self.messages_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one local delivery.
    pub fn inc_delivered_local(&self) {
        self.messages_delivered_local.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one dropped message.
    pub fn inc_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads the counters alongside `transport`.
    pub fn snapshot(&self, transport: MetricsSnapshot) -> DatapathMetricsSnapshot {
        DatapathMetricsSnapshot {
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
            messages_delivered_local: self.messages_delivered_local.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            transport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let m = DatapathMetrics::new();
        m.inc_forwarded();
        m.inc_forwarded();
        m.inc_delivered_local();
        m.inc_dropped();
        let snap = m.snapshot(MetricsSnapshot::default());
        assert_eq!(snap.messages_forwarded, 2);
        assert_eq!(snap.messages_delivered_local, 1);
        assert_eq!(snap.messages_dropped, 1);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["transport"]["frames_sent"], 0);
    }
}
