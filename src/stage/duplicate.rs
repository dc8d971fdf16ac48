//! Packet duplication: Bernoulli fan-out into deep copies.

use std::sync::atomic::{AtomicU32, Ordering};

use super::{AtomicRate, ImpairmentStage, StageControl};
use crate::packet::CapturedPacket;
use crate::rng;

pub const COPIES_MIN: u32 = 1;
pub const COPIES_MAX: u32 = 5;

pub struct DuplicateStage {
    control: StageControl,
    rate: AtomicRate,
    copies: AtomicU32,
}

impl Default for DuplicateStage {
    fn default() -> Self {
        Self::new()
    }
}

impl DuplicateStage {
    pub fn new() -> Self {
        Self {
            control: StageControl::new(),
            rate: AtomicRate::new(0.0),
            copies: AtomicU32::new(COPIES_MIN),
        }
    }

    pub fn set_rate(&self, rate: f32) {
        self.rate.set(rate);
    }

    pub fn rate(&self) -> f32 {
        self.rate.get()
    }

    /// Extra copies emitted per duplicated packet, clamped to `[1, 5]`.
    pub fn set_copies(&self, copies: u32) {
        self.copies
            .store(copies.clamp(COPIES_MIN, COPIES_MAX), Ordering::Relaxed);
    }

    pub fn copies(&self) -> u32 {
        self.copies.load(Ordering::Relaxed)
    }
}

impl ImpairmentStage for DuplicateStage {
    fn process_batch(&self, batch: Vec<CapturedPacket>) -> Vec<CapturedPacket> {
        if !self.control.is_enabled() {
            return batch;
        }

        let rate = self.rate.get();
        let mut out = Vec::with_capacity(batch.len() * 2);
        for packet in batch {
            if !(self.control.admits(&packet.addr) && rng::roll(rate)) {
                out.push(packet);
                continue;
            }

            // Deep copies land immediately behind the original, bytes and
            // metadata identical.
            let copies = self.copies.load(Ordering::Relaxed) as usize;
            let template = packet.clone();
            out.push(packet);
            for _ in 1..copies {
                out.push(template.clone());
            }
            out.push(template);
        }
        out
    }

    fn drain_due(&self) -> Vec<CapturedPacket> {
        Vec::new()
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
