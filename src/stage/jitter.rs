//! Jitter: a uniformly random delay per packet.

use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use super::{DelayedPacket, ImpairmentStage, StageControl, drain_due_packets, flush_packets};
use crate::packet::CapturedPacket;
use crate::rng;

pub struct JitterStage {
    control: StageControl,
    min_ms: AtomicU32,
    max_ms: AtomicU32,
    heap: Mutex<BinaryHeap<DelayedPacket>>,
}

impl Default for JitterStage {
    fn default() -> Self {
        Self::new()
    }
}

impl JitterStage {
    pub fn new() -> Self {
        Self {
            control: StageControl::new(),
            min_ms: AtomicU32::new(0),
            max_ms: AtomicU32::new(50),
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Delay bounds in milliseconds; stored normalized so `min <= max`.
    /// Packets already scheduled keep the deadline they drew under the old
    /// range.
    pub fn set_range(&self, min_ms: u32, max_ms: u32) {
        self.min_ms.store(min_ms.min(max_ms), Ordering::Relaxed);
        self.max_ms.store(min_ms.max(max_ms), Ordering::Relaxed);
    }

    pub fn min_ms(&self) -> u32 {
        self.min_ms.load(Ordering::Relaxed)
    }

    pub fn max_ms(&self) -> u32 {
        self.max_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn flush(&self) -> Vec<CapturedPacket> {
        flush_packets(&self.heap)
    }
}

impl ImpairmentStage for JitterStage {
    fn process_batch(&self, batch: Vec<CapturedPacket>) -> Vec<CapturedPacket> {
        if !self.control.is_enabled() {
            return batch;
        }

        let now = Instant::now();
        let (min_ms, max_ms) = (
            self.min_ms.load(Ordering::Relaxed),
            self.max_ms.load(Ordering::Relaxed),
        );

        let mut immediate = Vec::new();
        let mut heap = self
            .heap
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for packet in batch {
            if !self.control.admits(&packet.addr) {
                immediate.push(packet);
                continue;
            }
            let delay = rng::range_inclusive(min_ms, max_ms);
            heap.push(DelayedPacket {
                release_at: now + Duration::from_millis(u64::from(delay)),
                packet,
            });
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
