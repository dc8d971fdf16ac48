//! Shared helpers for unit and scenario tests: deterministic packet
//! builders, address constructors, and a scriptable in-memory diverter.

use std::collections::VecDeque;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use anyhow::{Result, bail};

use crate::divert::{DivertAddress, DivertHandle, DivertLayer, DivertParam, Diverter, RecvError};
use crate::packet::CapturedPacket;
use crate::parse;

const IPV4_UDP_OVERHEAD: usize = 28;

/// Minimal IPv4/UDP packet with a correct Total Length field. Checksums stay
/// zero; the pipeline preserves header bytes, it never validates them.
pub fn udp_packet(
    src: [u8; 4],
    dst: [u8; 4],
    src_port: u16,
    dst_port: u16,
    payload_len: usize,
) -> Vec<u8> {
    let total = IPV4_UDP_OVERHEAD + payload_len;
    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[8] = 64;
    pkt[9] = parse::IPPROTO_UDP;
    pkt[12..16].copy_from_slice(&src);
    pkt[16..20].copy_from_slice(&dst);
    pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
    pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
    pkt[24..26].copy_from_slice(&((8 + payload_len) as u16).to_be_bytes());
    pkt
}

/// Minimal IPv4/TCP packet (20-byte TCP header, no options).
pub fn tcp_packet(
    src: [u8; 4],
    dst: [u8; 4],
    src_port: u16,
    dst_port: u16,
    payload_len: usize,
) -> Vec<u8> {
    let total = 40 + payload_len;
    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[8] = 64;
    pkt[9] = parse::IPPROTO_TCP;
    pkt[12..16].copy_from_slice(&src);
    pkt[16..20].copy_from_slice(&dst);
    pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
    pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
    pkt[32] = 0x50; // data offset: 5 words
    pkt[33] = 0x18; // PSH|ACK
    pkt
}

/// Minimal IPv6/UDP packet.
pub fn ipv6_udp_packet(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    payload_len: usize,
) -> Vec<u8> {
    let udp_len = 8 + payload_len;
    let mut pkt = vec![0u8; 40 + udp_len];
    pkt[0] = 0x60;
    pkt[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    pkt[6] = parse::IPPROTO_UDP;
    pkt[7] = 64;
    pkt[8..24].copy_from_slice(&src.octets());
    pkt[24..40].copy_from_slice(&dst.octets());
    pkt[40..42].copy_from_slice(&src_port.to_be_bytes());
    pkt[42..44].copy_from_slice(&dst_port.to_be_bytes());
    pkt[44..46].copy_from_slice(&(udp_len as u16).to_be_bytes());
    pkt
}

pub fn outbound_addr() -> DivertAddress {
    DivertAddress {
        outbound: true,
        loopback: false,
        impostor: false,
        if_idx: 7,
        sub_if_idx: 0,
    }
}

pub fn inbound_addr() -> DivertAddress {
    DivertAddress {
        outbound: false,
        ..outbound_addr()
    }
}

/// A pipeline packet whose wire length is exactly `total_len` bytes.
pub fn test_packet(total_len: usize, addr: DivertAddress) -> CapturedPacket {
    assert!(total_len >= IPV4_UDP_OVERHEAD, "below IPv4/UDP overhead");
    CapturedPacket::new(
        udp_packet(
            [10, 0, 0, 1],
            [10, 0, 0, 2],
            4000,
            5000,
            total_len - IPV4_UDP_OVERHEAD,
        ),
        addr,
    )
}

/// `n` MTU-sized packets sharing one address.
pub fn test_batch(n: usize, addr: DivertAddress) -> Vec<CapturedPacket> {
    (0..n).map(|_| test_packet(1500, addr)).collect()
}

/// `n` small packets with their index written into the payload, so tests can
/// track positions across shuffles.
pub fn numbered_batch(n: usize, addr: DivertAddress) -> Vec<CapturedPacket> {
    (0..n as u32)
        .map(|i| {
            let mut packet = test_packet(64, addr);
            packet.data[IPV4_UDP_OVERHEAD..IPV4_UDP_OVERHEAD + 4].copy_from_slice(&i.to_be_bytes());
            packet
        })
        .collect()
}

pub fn payload_number(packet: &CapturedPacket) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&packet.data[IPV4_UDP_OVERHEAD..IPV4_UDP_OVERHEAD + 4]);
    u32::from_be_bytes(bytes)
}

/// Scriptable in-memory diverter.
///
/// Tests queue batches with [`push_batch`]; a capture worker's `recv_batch`
/// blocks until a batch is available or the receive side is shut down, then
/// delivers the batch in the driver's contiguous-buffer layout. Everything
/// the engine injects is recorded for inspection.
///
/// [`push_batch`]: MockDiverter::push_batch
#[derive(Default)]
pub struct MockDiverter {
    state: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    pending: Mutex<VecDeque<Vec<(Vec<u8>, DivertAddress)>>>,
    available: Condvar,
    shutdown: AtomicBool,
    injected: Mutex<Vec<(Vec<u8>, DivertAddress)>>,
    params_set: Mutex<Vec<(DivertParam, u64)>>,
    reject_params: AtomicBool,
    fail_open: AtomicBool,
    fail_send: AtomicBool,
    open_count: AtomicU64,
    close_count: AtomicU64,
}

impl MockDiverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one receive batch for delivery.
    pub fn push_batch(&self, batch: Vec<(Vec<u8>, DivertAddress)>) {
        self.state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(batch);
        self.state.available.notify_all();
    }

    /// Everything injected so far, in send order.
    pub fn injected(&self) -> Vec<(Vec<u8>, DivertAddress)> {
        self.state
            .injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn injected_count(&self) -> usize {
        self.state
            .injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Every `set_param` call the engine made, in order.
    pub fn params_set(&self) -> Vec<(DivertParam, u64)> {
        self.state
            .params_set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_reject_params(&self, reject: bool) {
        self.state.reject_params.store(reject, Ordering::SeqCst);
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.state.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> u64 {
        self.state.open_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u64 {
        self.state.close_count.load(Ordering::SeqCst)
    }
}

impl Diverter for MockDiverter {
    fn open(
        &self,
        _filter: &str,
        _layer: DivertLayer,
        _flags: u64,
    ) -> Result<Arc<dyn DivertHandle>> {
        if self.state.fail_open.load(Ordering::SeqCst) {
            bail!("permission denied");
        }
        self.state.open_count.fetch_add(1, Ordering::SeqCst);
        // A fresh handle receives again even after a previous shutdown.
        self.state.shutdown.store(false, Ordering::SeqCst);
        Ok(Arc::new(MockHandle {
            state: self.state.clone(),
        }))
    }
}

struct MockHandle {
    state: Arc<MockState>,
}

impl DivertHandle for MockHandle {
    fn recv_batch(
        &self,
        buf: &mut [u8],
        addrs: &mut [DivertAddress],
    ) -> Result<(usize, usize), RecvError> {
        let mut pending = self
            .state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(batch) = pending.pop_front() {
                let mut offset = 0usize;
                let mut count = 0usize;
                for (data, addr) in batch {
                    if count >= addrs.len() || offset + data.len() > buf.len() {
                        break;
                    }
                    buf[offset..offset + data.len()].copy_from_slice(&data);
                    addrs[count] = addr;
                    offset += data.len();
                    count += 1;
                }
                return Ok((offset, count));
            }
            if self.state.shutdown.load(Ordering::SeqCst) {
                return Err(RecvError::NoData);
            }
            pending = self
                .state
                .available
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn send_batch(&self, buf: &[u8], addrs: &[DivertAddress]) -> Result<usize> {
        if self.state.fail_send.load(Ordering::SeqCst) {
            bail!("send rejected");
        }
        let mut injected = self
            .state
            .injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut offset = 0usize;
        for addr in addrs {
            let Some(parsed) = parse::parse_packet(&buf[offset..]) else {
                bail!("unparseable packet in send buffer at offset {offset}");
            };
            injected.push((buf[offset..offset + parsed.total_len].to_vec(), *addr));
            offset += parsed.total_len;
        }
        Ok(offset)
    }

    fn set_param(&self, param: DivertParam, value: u64) -> bool {
        if self.state.reject_params.load(Ordering::SeqCst) {
            return false;
        }
        self.state
            .params_set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((param, value));
        true
    }

    fn get_param(&self, param: DivertParam) -> Option<u64> {
        match param {
            DivertParam::VersionMajor => Some(2),
            DivertParam::VersionMinor => Some(2),
            _ => self
                .state
                .params_set
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .rev()
                .find(|(set, _)| *set == param)
                .map(|(_, value)| *value),
        }
    }

    fn shutdown_recv(&self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        self.state.available.notify_all();
    }

    fn close(&self) {
        self.state.close_count.fetch_add(1, Ordering::SeqCst);
    }
}
