//! Fixed latency: every gated packet shares the same deadline offset.

use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::{DelayedPacket, ImpairmentStage, StageControl, drain_due_packets, flush_packets};
use crate::packet::CapturedPacket;

pub struct LatencyStage {
    control: StageControl,
    delay_ms: AtomicU64,
    heap: Mutex<BinaryHeap<DelayedPacket>>,
}

impl Default for LatencyStage {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStage {
    pub fn new() -> Self {
        Self {
            control: StageControl::new(),
            delay_ms: AtomicU64::new(0),
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn set_delay_ms(&self, delay_ms: u64) {
        self.delay_ms.store(delay_ms, Ordering::Relaxed);
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn flush(&self) -> Vec<CapturedPacket> {
        flush_packets(&self.heap)
    }
}

impl ImpairmentStage for LatencyStage {
    fn process_batch(&self, batch: Vec<CapturedPacket>) -> Vec<CapturedPacket> {
        if !self.control.is_enabled() {
            return batch;
        }

        let release_at =
            Instant::now() + Duration::from_millis(self.delay_ms.load(Ordering::Relaxed));

        let mut immediate = Vec::new();
        let mut heap = self
            .heap
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for packet in batch {
            if self.control.admits(&packet.addr) {
                heap.push(DelayedPacket { release_at, packet });
            } else {
                immediate.push(packet);
            }
        }
        immediate
    }

    fn drain_due(&self) -> Vec<CapturedPacket> {
        if !self.control.is_enabled() {
            return self.flush();
        }
        drain_due_packets(&self.heap)
    }

    fn is_enabled(&self) -> bool {
        self.control.is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.control.set_enabled(enabled);
    }

    fn set_inbound(&self, enabled: bool) {
        self.control.set_inbound(enabled);
    }

    fn set_outbound(&self, enabled: bool) {
        self.control.set_outbound(enabled);
    }
}
