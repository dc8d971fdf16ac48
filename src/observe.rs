//! Flow observation ring shared between capture workers and external
//! observers.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::divert::DivertAddress;
use crate::parse::ParsedHeaders;

/// One parsed packet header as seen by the capture worker.
#[derive(Clone, Debug, Serialize)]
pub struct ObservationRecord {
    /// 4 or 6.
    pub ip_version: u8,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    /// Zero unless the protocol is TCP or UDP.
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub length: u32,
    pub outbound: bool,
    pub loopback: bool,
    pub if_idx: u32,
    #[serde(skip)]
    pub captured_at: Instant,
}

impl ObservationRecord {
    pub(crate) fn from_parsed(
        parsed: &ParsedHeaders,
        addr: &DivertAddress,
        captured_at: Instant,
    ) -> Self {
        Self {
            ip_version: parsed.ip_version,
            src_addr: parsed.src_addr,
            dst_addr: parsed.dst_addr,
            src_port: parsed.src_port,
            dst_port: parsed.dst_port,
            protocol: parsed.protocol,
            length: parsed.total_len as u32,
            outbound: addr.outbound,
            loopback: addr.loopback,
            if_idx: addr.if_idx,
            captured_at,
        }
    }
}

/// Bounded double-ended buffer of observations. Capture workers push, the
/// control surface drains; overflow evicts the oldest entry.
pub struct ObservationRing {
    entries: Mutex<VecDeque<ObservationRecord>>,
    capacity: AtomicUsize,
}

impl ObservationRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: AtomicUsize::new(capacity.max(1)),
        }
    }

    /// Append a record. Returns true when the ring was full and the oldest
    /// entry was evicted to make room.
    pub fn push(&self, record: ObservationRecord) -> bool {
        let capacity = self.capacity.load(Ordering::Relaxed);
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.push_back(record);
        if entries.len() > capacity {
            entries.pop_front();
            true
        } else {
            false
        }
    }

    /// Drain everything in capture order.
    pub fn take_all(&self) -> Vec<ObservationRecord> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.drain(..).collect()
    }

    /// Adjust the bound; takes effect on the next push.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_packet;
    use crate::test_helpers::{inbound_addr, udp_packet};

    fn record() -> ObservationRecord {
        let pkt = udp_packet([10, 0, 0, 1], [10, 0, 0, 2], 1000, 2000, 16);
        let parsed = parse_packet(&pkt).expect("parse");
        ObservationRecord::from_parsed(&parsed, &inbound_addr(), Instant::now())
    }

    #[test]
    fn test_push_and_drain() {
        let ring = ObservationRing::new(8);
        ring.push(record());
        ring.push(record());
        assert_eq!(ring.len(), 2);

        let drained = ring.take_all();
        assert_eq!(drained.len(), 2);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let ring = ObservationRing::new(2);
        assert!(!ring.push(record()));
        assert!(!ring.push(record()));
        assert!(ring.push(record()));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_capacity_shrinks_on_next_push() {
        let ring = ObservationRing::new(4);
        for _ in 0..4 {
            ring.push(record());
        }
        ring.set_capacity(2);
        // One push after the shrink evicts a single entry; the ring converges
        // toward the new bound rather than truncating in place.
        assert!(ring.push(record()));
        assert_eq!(ring.len(), 4);
    }
}
