//! Packet loss: stateless Bernoulli drop.

use super::{AtomicRate, ImpairmentStage, StageControl};
use crate::packet::CapturedPacket;
use crate::rng;

pub struct LossStage {
    control: StageControl,
    rate: AtomicRate,
}

impl Default for LossStage {
    fn default() -> Self {
        Self::new()
    }
}

impl LossStage {
    pub fn new() -> Self {
        Self {
            control: StageControl::new(),
            rate: AtomicRate::new(0.0),
        }
    }

    /// Drop probability in percent, clamped to `[0, 100]`.
    pub fn set_rate(&self, rate: f32) {
        self.rate.set(rate);
    }

    pub fn rate(&self) -> f32 {
        self.rate.get()
    }
}

impl ImpairmentStage for LossStage {
    fn process_batch(&self, batch: Vec<CapturedPacket>) -> Vec<CapturedPacket> {
        if !self.control.is_enabled() {
            return batch;
        }

        let rate = self.rate.get();
        let mut survivors = Vec::with_capacity(batch.len());
        for packet in batch {
            if self.control.admits(&packet.addr) && rng::roll(rate) {
                // Dropped: ownership ends here.
                continue;
            }
            survivors.push(packet);
        }
        survivors
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
