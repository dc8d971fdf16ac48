//! Capture parameters and their accepted ranges.

use std::ops::RangeInclusive;

use anyhow::{Result, bail};
use serde::Serialize;

use crate::divert::DIVERT_BATCH_MAX;

/// Standard Ethernet MTU.
pub const DEFAULT_MTU: u32 = 1500;
/// Largest IP packet the engine will carry.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 65535;

pub const QUEUE_LENGTH_RANGE: RangeInclusive<u64> = 32..=16384;
pub const QUEUE_TIME_RANGE: RangeInclusive<u64> = 100..=16000;
pub const QUEUE_BYTES_RANGE: RangeInclusive<u64> = 65535..=33554432;
pub const BATCH_SIZE_RANGE: RangeInclusive<u32> = 1..=DIVERT_BATCH_MAX as u32;
pub const WORKER_THREADS_RANGE: RangeInclusive<u32> = 1..=8;

/// Diverter and dispatcher tunables, validated as a whole by
/// [`CaptureParams::validate`] before the engine starts.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CaptureParams {
    /// Diverter packet-queue length (packets).
    pub queue_length: u64,
    /// How long a packet may wait at the kernel boundary before the driver
    /// drops it (milliseconds).
    pub queue_time_ms: u64,
    /// Diverter packet-queue size (bytes).
    pub queue_bytes: u64,

    /// Addresses per batched receive.
    pub batch_size: u32,
    /// Number of capture worker threads. Receive order is only preserved
    /// within one worker; keep this at 1 when strict ordering matters.
    pub worker_threads: u32,
    /// Per-worker receive buffer; must hold at least one maximum-size packet.
    pub recv_buffer_bytes: u32,

    /// Display-buffer hint for external observers draining the ring.
    pub observation_capacity: usize,
    /// Capacity of the engine-owned observation ring.
    pub ring_capacity: usize,

    pub mtu: u32,
    pub max_packet_size: u32,
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            queue_length: 8192,
            queue_time_ms: 2000,
            queue_bytes: 4194304,
            batch_size: 10,
            worker_threads: 1,
            recv_buffer_bytes: DEFAULT_MAX_PACKET_SIZE,
            observation_capacity: 1000,
            ring_capacity: 1024,
            mtu: DEFAULT_MTU,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl CaptureParams {
    /// Range-check every tunable. Out-of-range values are configuration
    /// errors surfaced through `start`, not silently clamped.
    pub fn validate(&self) -> Result<()> {
        if !QUEUE_LENGTH_RANGE.contains(&self.queue_length) {
            bail!(
                "queue_length {} outside {:?}",
                self.queue_length,
                QUEUE_LENGTH_RANGE
            );
        }
        if !QUEUE_TIME_RANGE.contains(&self.queue_time_ms) {
            bail!(
                "queue_time_ms {} outside {:?}",
                self.queue_time_ms,
                QUEUE_TIME_RANGE
            );
        }
        if !QUEUE_BYTES_RANGE.contains(&self.queue_bytes) {
            bail!(
                "queue_bytes {} outside {:?}",
                self.queue_bytes,
                QUEUE_BYTES_RANGE
            );
        }
        if !BATCH_SIZE_RANGE.contains(&self.batch_size) {
            bail!(
                "batch_size {} outside {:?}",
                self.batch_size,
                BATCH_SIZE_RANGE
            );
        }
        if !WORKER_THREADS_RANGE.contains(&self.worker_threads) {
            bail!(
                "worker_threads {} outside {:?}",
                self.worker_threads,
                WORKER_THREADS_RANGE
            );
        }
        if self.recv_buffer_bytes < self.max_packet_size {
            bail!(
                "recv_buffer_bytes {} smaller than max_packet_size {}",
                self.recv_buffer_bytes,
                self.max_packet_size
            );
        }
        if self.ring_capacity == 0 {
            bail!("ring_capacity must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(CaptureParams::default().validate().is_ok());
    }

    #[test]
    fn test_queue_length_bounds() {
        let mut params = CaptureParams::default();
        params.queue_length = 31;
        assert!(params.validate().is_err());
        params.queue_length = 32;
        assert!(params.validate().is_ok());
        params.queue_length = 16384;
        assert!(params.validate().is_ok());
        params.queue_length = 16385;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_batch_size_bounds() {
        let mut params = CaptureParams::default();
        params.batch_size = 0;
        assert!(params.validate().is_err());
        params.batch_size = 255;
        assert!(params.validate().is_ok());
        params.batch_size = 256;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_worker_threads_bounds() {
        let mut params = CaptureParams::default();
        params.worker_threads = 0;
        assert!(params.validate().is_err());
        params.worker_threads = 9;
        assert!(params.validate().is_err());
        params.worker_threads = 8;
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_recv_buffer_must_hold_max_packet() {
        let mut params = CaptureParams::default();
        params.recv_buffer_bytes = params.max_packet_size - 1;
        assert!(params.validate().is_err());
        params.recv_buffer_bytes = params.max_packet_size;
        assert!(params.validate().is_ok());
    }
}
