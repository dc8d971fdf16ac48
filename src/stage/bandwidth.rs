//! Bandwidth shaping: a FIFO drained by a token bucket denominated in bytes.
//!
//! The bucket arithmetic is floating point: integer math starves the queue
//! at low rates where a 10 ms tick earns fractional bytes.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use super::{ImpairmentStage, StageControl};
use crate::packet::CapturedPacket;

/// Bytes per second per kbit/s of configured rate.
const BYTES_PER_KBPS: f64 = 125.0;

struct Bucket {
    available_bytes: f64,
    max_burst_bytes: f64,
    last_refill: Instant,
    queue: VecDeque<CapturedPacket>,
}

impl Bucket {
    /// `kbps * 125 * Δt`, saturated at one second of budget.
    fn refill(&mut self, kbps: u32) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let added = f64::from(kbps) * BYTES_PER_KBPS * elapsed;
        self.available_bytes = (self.available_bytes + added).min(self.max_burst_bytes);
        self.last_refill = now;
    }

    /// Pop from the head while tokens cover the head packet; stop at the
    /// first that does not fit.
    fn drain_affordable(&mut self, out: &mut Vec<CapturedPacket>) {
        while let Some(head) = self.queue.front() {
            let needed = head.data.len() as f64;
            if self.available_bytes < needed {
                break;
            }
            self.available_bytes -= needed;
            if let Some(packet) = self.queue.pop_front() {
                out.push(packet);
            }
        }
    }
}

pub struct BandwidthStage {
    control: StageControl,
    kbps: AtomicU32,
    bucket: Mutex<Bucket>,
}

impl Default for BandwidthStage {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthStage {
    pub fn new() -> Self {
        let kbps = 1000u32;
        Self {
            control: StageControl::new(),
            kbps: AtomicU32::new(kbps),
            bucket: Mutex::new(Bucket {
                available_bytes: 0.0,
                max_burst_bytes: f64::from(kbps) * BYTES_PER_KBPS,
                last_refill: Instant::now(),
                queue: VecDeque::new(),
            }),
        }
    }

    /// Rate limit in kbit/s. Burst capacity tracks the rate: one second of
    /// budget.
    pub fn set_kbps(&self, kbps: u32) {
        self.kbps.store(kbps, Ordering::Relaxed);
        let mut bucket = self.lock_bucket();
        bucket.max_burst_bytes = f64::from(kbps) * BYTES_PER_KBPS;
    }

    pub fn kbps(&self) -> u32 {
        self.kbps.load(Ordering::Relaxed)
    }

    /// Enabling seeds the bucket half full so shaping starts without a
    /// cold-start stall.
    pub fn enable(&self) {
        self.control.set_enabled(true);
        let mut bucket = self.lock_bucket();
        bucket.available_bytes = bucket.max_burst_bytes / 2.0;
        bucket.last_refill = Instant::now();
    }

    pub(crate) fn flush(&self) -> Vec<CapturedPacket> {
        let mut bucket = self.lock_bucket();
        bucket.queue.drain(..).collect()
    }

    fn lock_bucket(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ImpairmentStage for BandwidthStage {
    fn process_batch(&self, batch: Vec<CapturedPacket>) -> Vec<CapturedPacket> {
        if !self.control.is_enabled() {
            return batch;
        }

        let mut bucket = self.lock_bucket();
        bucket.refill(self.kbps.load(Ordering::Relaxed));

        let mut out = Vec::with_capacity(batch.len());
        for packet in batch {
            if self.control.admits(&packet.addr) {
                bucket.queue.push_back(packet);
            } else {
                out.push(packet);
            }
        }
        bucket.drain_affordable(&mut out);
        out
    }

    fn drain_due(&self) -> Vec<CapturedPacket> {
        if !self.control.is_enabled() {
            return self.flush();
        }

        let mut bucket = self.lock_bucket();
        bucket.refill(self.kbps.load(Ordering::Relaxed));
        let mut out = Vec::new();
        bucket.drain_affordable(&mut out);
        out
    }

    fn is_enabled(&self) -> bool {
        self.control.is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.enable();
        } else {
            self.control.set_enabled(false);
        }
    }

    fn set_inbound(&self, enabled: bool) {
        self.control.set_inbound(enabled);
    }

    fn set_outbound(&self, enabled: bool) {
        self.control.set_outbound(enabled);
    }
}
