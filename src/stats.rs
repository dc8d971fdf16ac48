//! Monotonic engine counters and the snapshot exported to control surfaces.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters, updated by capture and release workers. Monotonic for the
/// lifetime of a capture session; `start` resets them.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub packets_captured: AtomicU64,
    /// Observations evicted from a full ring, not packets lost on the wire.
    pub packets_dropped_observation: AtomicU64,
    pub packets_injected: AtomicU64,
    pub bytes_captured: AtomicU64,
    pub batches: AtomicU64,
    pub total_batch_packets: AtomicU64,
}

impl EngineStats {
    pub fn reset(&self) {
        self.packets_captured.store(0, Ordering::Relaxed);
        self.packets_dropped_observation.store(0, Ordering::Relaxed);
        self.packets_injected.store(0, Ordering::Relaxed);
        self.bytes_captured.store(0, Ordering::Relaxed);
        self.batches.store(0, Ordering::Relaxed);
        self.total_batch_packets.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let batches = self.batches.load(Ordering::Relaxed);
        let total = self.total_batch_packets.load(Ordering::Relaxed);
        StatsSnapshot {
            packets_captured: self.packets_captured.load(Ordering::Relaxed),
            packets_dropped_observation: self.packets_dropped_observation.load(Ordering::Relaxed),
            packets_injected: self.packets_injected.load(Ordering::Relaxed),
            bytes_captured: self.bytes_captured.load(Ordering::Relaxed),
            batches,
            avg_batch_size: if batches > 0 {
                total as f64 / batches as f64
            } else {
                0.0
            },
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub packets_captured: u64,
    pub packets_dropped_observation: u64,
    pub packets_injected: u64,
    pub bytes_captured: u64,
    pub batches: u64,
    pub avg_batch_size: f64,
}

impl StatsSnapshot {
    /// Serialize to JSON for external consumers.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_empty() {
        let stats = EngineStats::default();
        let snap = stats.snapshot();
        assert_eq!(snap.packets_captured, 0);
        assert_eq!(snap.avg_batch_size, 0.0);
    }

    #[test]
    fn test_avg_batch_size() {
        let stats = EngineStats::default();
        stats.batches.store(4, Ordering::Relaxed);
        stats.total_batch_packets.store(10, Ordering::Relaxed);
        assert_eq!(stats.snapshot().avg_batch_size, 2.5);
    }

    #[test]
    fn test_reset_clears_everything() {
        let stats = EngineStats::default();
        stats.packets_captured.store(7, Ordering::Relaxed);
        stats.bytes_captured.store(900, Ordering::Relaxed);
        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_to_json_contains_expected_fields() {
        let json = EngineStats::default().snapshot().to_json();
        assert!(json.contains("\"packets_captured\""));
        assert!(json.contains("\"packets_injected\""));
        assert!(json.contains("\"avg_batch_size\""));
    }
}
