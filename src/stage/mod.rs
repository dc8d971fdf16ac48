//! Impairment stages and their shared plumbing.
//!
//! All six stages satisfy one contract: [`ImpairmentStage`]. A stage consumes
//! a batch, returns the packets that continue downstream this tick, and hands
//! anything it retained back out through [`drain_due`] once deadlines expire
//! (or immediately, when the stage is disabled). Configuration scalars are
//! atomics so setters never block a worker mid-batch; they take effect on the
//! next batch and never abort an in-flight packet.
//!
//! [`drain_due`]: ImpairmentStage::drain_due

mod bandwidth;
mod duplicate;
mod jitter;
mod latency;
mod loss;
mod reorder;

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

pub use bandwidth::BandwidthStage;
pub use duplicate::DuplicateStage;
pub use jitter::JitterStage;
pub use latency::LatencyStage;
pub use loss::LossStage;
pub use reorder::ReorderStage;

use crate::divert::DivertAddress;
use crate::packet::CapturedPacket;

/// Uniform contract all six impairment stages implement.
///
/// Both operations are safe to call concurrently with the setters.
pub trait ImpairmentStage: Send + Sync {
    /// Run a batch through the stage. The returned packets continue
    /// downstream this tick; packets not returned were dropped or retained
    /// with a future release deadline. A disabled stage returns the input
    /// unchanged.
    fn process_batch(&self, batch: Vec<CapturedPacket>) -> Vec<CapturedPacket>;

    /// Packets whose deadlines have expired. Empty for stateless stages.
    /// When the stage is disabled, flushes everything it retained.
    fn drain_due(&self) -> Vec<CapturedPacket>;

    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn set_inbound(&self, enabled: bool);
    fn set_outbound(&self, enabled: bool);
}

/// Enable flag plus the per-direction gate every stage carries.
#[derive(Debug)]
pub(crate) struct StageControl {
    enabled: AtomicBool,
    inbound: AtomicBool,
    outbound: AtomicBool,
}

impl StageControl {
    pub(crate) fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            inbound: AtomicBool::new(true),
            outbound: AtomicBool::new(true),
        }
    }

    #[inline]
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn set_inbound(&self, enabled: bool) {
        self.inbound.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn set_outbound(&self, enabled: bool) {
        self.outbound.store(enabled, Ordering::Relaxed);
    }

    /// The direction gate: does this packet participate in the stage?
    /// Packets that fail the gate pass through unchanged.
    #[inline]
    pub(crate) fn admits(&self, addr: &DivertAddress) -> bool {
        if addr.outbound {
            self.outbound.load(Ordering::Relaxed)
        } else {
            self.inbound.load(Ordering::Relaxed)
        }
    }
}

/// Atomic percentage rate stored as `f32` bits, clamped to `[0, 100]`.
#[derive(Debug)]
pub(crate) struct AtomicRate(std::sync::atomic::AtomicU32);

impl AtomicRate {
    pub(crate) fn new(rate: f32) -> Self {
        Self(std::sync::atomic::AtomicU32::new(
            rate.clamp(0.0, 100.0).to_bits(),
        ))
    }

    pub(crate) fn set(&self, rate: f32) {
        self.0
            .store(rate.clamp(0.0, 100.0).to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Heap entry for the time-delay stages: the packet plus its deadline. The
/// deadline lives here rather than on the packet so ownership of the record
/// stays a straight move.
#[derive(Debug)]
pub(crate) struct DelayedPacket {
    pub release_at: Instant,
    pub packet: CapturedPacket,
}

impl PartialEq for DelayedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.release_at == other.release_at
    }
}

impl Eq for DelayedPacket {}

impl PartialOrd for DelayedPacket {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedPacket {
    // Reversed so BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.release_at.cmp(&self.release_at)
    }
}

/// Pop every entry whose deadline has passed, earliest first.
pub(crate) fn drain_due_packets(heap: &Mutex<BinaryHeap<DelayedPacket>>) -> Vec<CapturedPacket> {
    let now = Instant::now();
    let mut heap = heap
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let mut due = Vec::new();
    while heap.peek().is_some_and(|head| head.release_at <= now) {
        if let Some(entry) = heap.pop() {
            due.push(entry.packet);
        }
    }
    due
}

/// Pop everything in release-time order, deadlines notwithstanding. Used when
/// a disabled stage flushes its buffer.
pub(crate) fn flush_packets(heap: &Mutex<BinaryHeap<DelayedPacket>>) -> Vec<CapturedPacket> {
    let mut heap = heap
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let mut all = Vec::with_capacity(heap.len());
    while let Some(entry) = heap.pop() {
        all.push(entry.packet);
    }
    all
}
