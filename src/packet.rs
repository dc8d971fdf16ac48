//! The packet record that moves through the impairment pipeline.

use std::time::Instant;

use crate::divert::DivertAddress;

/// One captured IP packet: its wire bytes, the diverter metadata needed to
/// re-inject it, and the capture timestamp.
///
/// Ownership moves exactly once per stage: a packet is either passed through,
/// dropped, retained inside a stage until a deadline, or deep-copied by the
/// duplicate stage. `data.len()` always equals the wire IP length and is
/// never empty.
#[derive(Clone, Debug)]
pub struct CapturedPacket {
    pub data: Vec<u8>,
    pub addr: DivertAddress,
    pub captured_at: Instant,
}

impl CapturedPacket {
    pub fn new(data: Vec<u8>, addr: DivertAddress) -> Self {
        Self {
            data,
            addr,
            captured_at: Instant::now(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
