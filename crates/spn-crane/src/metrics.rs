//! Injected crane lifecycle metrics.
//!
//! A [`CraneMetrics`] handle is shared by all cranes of one node and
//! incremented at lifecycle transitions. Export to a metrics backend is
//! the embedder's concern; this module only counts.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle counters for cranes.
#[derive(Debug, Default)]
pub struct CraneMetrics {
    started: AtomicU64,
    stopped: AtomicU64,
    shipments_loaded: AtomicU64,
    bytes_loaded: AtomicU64,
    blocks_unloaded: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Cranes started.
    pub started: u64,
    /// Cranes stopped.
    pub stopped: u64,
    /// Shipments written to ships.
    pub shipments_loaded: u64,
    /// Total bytes written to ships, including padding.
    pub bytes_loaded: u64,
    /// Blocks read from ships.
    pub blocks_unloaded: u64,
}

impl CraneMetrics {
    /// Record a crane start.
    pub fn record_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a crane stop.
    pub fn record_stop(&self) {
        self.stopped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one shipment of `bytes` written to a ship.
    pub fn record_load(&self, bytes: usize) {
        self.shipments_loaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_loaded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record one block read from a ship.
    pub fn record_unload(&self) {
        self.blocks_unloaded.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            stopped: self.stopped.load(Ordering::Relaxed),
            shipments_loaded: self.shipments_loaded.load(Ordering::Relaxed),
            bytes_loaded: self.bytes_loaded.load(Ordering::Relaxed),
            blocks_unloaded: self.blocks_unloaded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = CraneMetrics::default();
        metrics.record_start();
        metrics.record_load(100);
        metrics.record_load(50);
        metrics.record_unload();
        metrics.record_stop();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.started, 1);
        assert_eq!(snapshot.stopped, 1);
        assert_eq!(snapshot.shipments_loaded, 2);
        assert_eq!(snapshot.bytes_loaded, 150);
        assert_eq!(snapshot.blocks_unloaded, 1);
    }
}
