//! Packet reordering: a small resident window, shuffled when triggered.
//!
//! Keeping a few packets resident and emitting the rest is what makes
//! reordering observable at the receiver without out-of-order injection
//! support from the OS. Every incoming packet joins the buffer; once
//! buffered, a packet is subject to the buffer's policy regardless of
//! direction.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use rand::seq::SliceRandom;

use super::{AtomicRate, ImpairmentStage, StageControl};
use crate::packet::CapturedPacket;
use crate::rng;

pub const GAP_MIN: u32 = 2;
pub const GAP_MAX: u32 = 10;

pub struct ReorderStage {
    control: StageControl,
    rate: AtomicRate,
    gap: AtomicU32,
    buffer: Mutex<VecDeque<CapturedPacket>>,
}

impl Default for ReorderStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ReorderStage {
    pub fn new() -> Self {
        Self {
            control: StageControl::new(),
            rate: AtomicRate::new(0.0),
            gap: AtomicU32::new(3),
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_rate(&self, rate: f32) {
        self.rate.set(rate);
    }

    pub fn rate(&self) -> f32 {
        self.rate.get()
    }

    /// Minimum buffer occupancy before the stage is willing to emit, clamped
    /// to `[2, 10]`.
    pub fn set_gap(&self, gap: u32) {
        self.gap.store(gap.clamp(GAP_MIN, GAP_MAX), Ordering::Relaxed);
    }

    pub fn gap(&self) -> u32 {
        self.gap.load(Ordering::Relaxed)
    }

    /// Empty the buffer in current order, policy notwithstanding.
    pub(crate) fn flush(&self) -> Vec<CapturedPacket> {
        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        buffer.drain(..).collect()
    }
}

impl ImpairmentStage for ReorderStage {
    fn process_batch(&self, batch: Vec<CapturedPacket>) -> Vec<CapturedPacket> {
        if !self.control.is_enabled() {
            return batch;
        }

        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        buffer.extend(batch);

        let gap = self.gap.load(Ordering::Relaxed) as usize;
        if buffer.len() < gap {
            return Vec::new();
        }

        // Release everything but half a gap; the holdback is what lets a
        // shuffled packet land behind later arrivals.
        let release = buffer.len() - gap / 2;
        if rng::roll(self.rate.get()) {
            buffer.make_contiguous().shuffle(&mut rand::rng());
        }
        buffer.drain(..release).collect()
    }

    fn drain_due(&self) -> Vec<CapturedPacket> {
        if self.control.is_enabled() {
            return Vec::new();
        }
        self.flush()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{numbered_batch, outbound_addr, payload_number, test_batch};

    #[test]
    fn test_disabled_is_identity() {
        let stage = ReorderStage::new();
        let out = stage.process_batch(test_batch(5, outbound_addr()));
        assert_eq!(out.len(), 5);
        assert!(stage.drain_due().is_empty());
    }

    #[test]
    fn test_below_gap_emits_nothing() {
        let stage = ReorderStage::new();
        stage.set_enabled(true);
        stage.set_gap(4);
        let out = stage.process_batch(test_batch(3, outbound_addr()));
        assert!(out.is_empty());
    }

    #[test]
    fn test_emits_all_but_half_gap() {
        let stage = ReorderStage::new();
        stage.set_enabled(true);
        stage.set_gap(4);
        stage.set_rate(0.0);

        let out = stage.process_batch(numbered_batch(20, outbound_addr()));
        assert_eq!(out.len(), 18);
        // Rate 0 takes no shuffle: order preserved.
        for (i, packet) in out.iter().enumerate() {
            assert_eq!(payload_number(packet), i as u32);
        }
    }

    #[test]
    fn test_shuffle_emits_permutation() {
        let stage = ReorderStage::new();
        stage.set_enabled(true);
        stage.set_gap(4);
        stage.set_rate(100.0);

        let out = stage.process_batch(numbered_batch(20, outbound_addr()));
        assert_eq!(out.len(), 18);

        let mut seen: Vec<u32> = out.iter().map(payload_number).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 18, "emitted packets must be distinct");
        assert!(seen.iter().all(|n| *n < 20));
    }

    #[test]
    fn test_holdback_released_on_disable() {
        let stage = ReorderStage::new();
        stage.set_enabled(true);
        stage.set_gap(4);
        stage.set_rate(0.0);

        let emitted = stage.process_batch(numbered_batch(20, outbound_addr()));
        assert_eq!(emitted.len(), 18);

        // Two packets stay resident while enabled.
        assert!(stage.drain_due().is_empty());
        stage.set_enabled(false);
        let remaining = stage.drain_due();
        assert_eq!(remaining.len(), 2);
        let numbers: Vec<u32> = remaining.iter().map(payload_number).collect();
        assert_eq!(numbers, vec![18, 19]);
    }

    #[test]
    fn test_gap_clamped() {
        let stage = ReorderStage::new();
        stage.set_gap(1);
        assert_eq!(stage.gap(), 2);
        stage.set_gap(50);
        assert_eq!(stage.gap(), 10);
    }

    #[test]
    fn test_minimum_gap_window() {
        let stage = ReorderStage::new();
        stage.set_enabled(true);
        stage.set_gap(2);
        stage.set_rate(0.0);

        // gap/2 == 1: exactly one packet held back per flush point.
        let out = stage.process_batch(numbered_batch(5, outbound_addr()));
        assert_eq!(out.len(), 4);
    }
}
