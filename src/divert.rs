//! Packet diverter capability.
//!
//! The engine consumes the kernel packet diverter through this trait pair so
//! the driver binding stays swappable (and mockable in tests). The contract
//! mirrors what the driver actually offers: batched receive and send over a
//! contiguous byte buffer with a parallel address array, enumerated queue
//! knobs, and a receive-side shutdown that unblocks pending receives.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

/// Upper bound on addresses per batched receive or send.
pub const DIVERT_BATCH_MAX: usize = 255;

/// Per-packet metadata supplied by the diverter.
///
/// Preserved bit-for-bit from receive to inject; the pipeline never mutates
/// it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DivertAddress {
    /// True for packets leaving this host, false for packets arriving.
    pub outbound: bool,
    pub loopback: bool,
    pub impostor: bool,
    pub if_idx: u32,
    pub sub_if_idx: u32,
}

/// Interception layer selector passed to [`Diverter::open`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DivertLayer {
    /// Whole IP packets, below the transport stack.
    Network,
}

/// Enumerated runtime knobs addressable through the handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DivertParam {
    QueueLength,
    QueueTime,
    QueueBytes,
    VersionMajor,
    VersionMinor,
}

/// Driver version reported through the handle parameters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub major: u64,
    pub minor: u64,
}

/// Failure modes of a batched receive.
#[derive(Debug)]
pub enum RecvError {
    /// The receive side was shut down and its queue is exhausted. Normal
    /// termination, never reported as an error.
    NoData,
    /// Any other driver-level failure; the worker records it and keeps going.
    Driver(String),
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvError::NoData => write!(f, "no more data"),
            RecvError::Driver(msg) => write!(f, "driver error: {msg}"),
        }
    }
}

impl std::error::Error for RecvError {}

/// An open diverter handle. Thread-safe for concurrent receives and sends.
pub trait DivertHandle: Send + Sync {
    /// Receive a batch of packets. Blocks until data is available or the
    /// receive side is shut down. Returns `(bytes_read, addresses_filled)`;
    /// the packets lie back-to-back in `buf` and `addrs[..n]` holds one entry
    /// per packet.
    fn recv_batch(
        &self,
        buf: &mut [u8],
        addrs: &mut [DivertAddress],
    ) -> Result<(usize, usize), RecvError>;

    /// Inject a batch of packets, symmetric to [`recv_batch`]: `buf` holds
    /// the packets back-to-back, `addrs` one entry per packet. Returns the
    /// number of bytes accepted.
    ///
    /// [`recv_batch`]: DivertHandle::recv_batch
    fn send_batch(&self, buf: &[u8], addrs: &[DivertAddress]) -> Result<usize>;

    /// Set a runtime knob. Returns false if the driver rejected the value.
    fn set_param(&self, param: DivertParam, value: u64) -> bool;

    /// Read a runtime knob.
    fn get_param(&self, param: DivertParam) -> Option<u64>;

    /// Shut down the receive side; blocked [`recv_batch`] calls return
    /// [`RecvError::NoData`] once the queue drains.
    ///
    /// [`recv_batch`]: DivertHandle::recv_batch
    fn shutdown_recv(&self);

    /// Close the handle. Further calls may fail.
    fn close(&self);
}

/// Factory for diverter handles.
///
/// The filter expression is an opaque pass-through string in the driver's
/// filter language (`"true"`, `"tcp"`, `"tcp.DstPort == 443"`, `"outbound"`,
/// `"!loopback"`, ...); the engine never parses it.
pub trait Diverter: Send + Sync {
    fn open(&self, filter: &str, layer: DivertLayer, flags: u64)
    -> Result<Arc<dyn DivertHandle>>;
}
