//! Transport surface counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of transport metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Frames written.
    pub frames_sent: u64,
    /// Frames read.
    pub frames_received: u64,
    /// Payload bytes written.
    pub bytes_sent: u64,
    /// Payload bytes read.
    pub bytes_received: u64,
    /// Failed writes.
    pub send_errors: u64,
    /// Connections established or accepted.
    pub connections_opened: u64,
    /// Connections closed for any reason.
    pub connections_closed: u64,
    /// Currently open connections.
    pub active_connections: u64,
}

/// Thread-safe transport metrics collector.
#[derive(Debug, Default)]
pub struct TransportMetrics {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    send_errors: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
}

impl TransportMetrics {
    /// Zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one frame carrying `bytes` of payload out.
    pub fn record_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Counts one frame carrying `bytes` of payload in.
    pub fn record_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Counts one failed write.
    pub fn inc_send_errors(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one opened connection.
    pub fn inc_connections_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one closed connection.
    pub fn inc_connections_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            connections_opened: opened,
            connections_closed: closed,
            active_connections: opened.saturating_sub(closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = TransportMetrics::new();
        metrics.record_sent(10);
        metrics.record_sent(5);
        metrics.record_received(7);
        metrics.inc_connections_opened();
        metrics.inc_connections_opened();
        metrics.inc_connections_closed();
        metrics.inc_send_errors();

        let snap = metrics.snapshot();
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.bytes_sent, 15);
        assert_eq!(snap.frames_received, 1);
        assert_eq!(snap.bytes_received, 7);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.send_errors, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_string(&TransportMetrics::new().snapshot()).unwrap();
        assert!(json.contains("\"frames_sent\":0"));
    }
}
