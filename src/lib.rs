//! User-space network impairment engine.
//!
//! Intercepts IP packets matched by a diverter filter expression, runs them
//! through a pipeline of synthetic fault stages (loss, duplication,
//! reordering, jitter, bandwidth shaping, fixed latency), and re-injects the
//! survivors into the network stack. Used to reproduce degraded-network
//! conditions on a developer machine.
//!
//! The pipeline applies its stages in a fixed canonical order
//! (`loss → duplicate → reorder → jitter → bandwidth → latency`); each stage
//! is independently enabled, rate-configured, and direction-gated at runtime
//! without interrupting traffic. Time-based stages park packets on deadlines
//! and hand them to per-stage release workers ticking every 10 ms.

// Use mimalloc as the global allocator for tests (non-Windows only)
#[cfg(not(windows))]
#[cfg(test)]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod divert;
pub mod engine;
pub mod observe;
pub mod packet;
pub mod params;
pub mod parse;
pub mod rng;
pub mod stage;
pub mod stats;

// Test helpers module - available when test-internals feature is enabled
#[cfg(any(test, feature = "test-internals"))]
pub mod test_helpers;

#[cfg(test)]
pub mod tests;

// Re-export the control-surface types
pub use divert::{
    DivertAddress, DivertHandle, DivertLayer, DivertParam, Diverter, RecvError, VersionInfo,
};
pub use engine::CaptureEngine;
pub use observe::ObservationRecord;
pub use packet::CapturedPacket;
pub use params::CaptureParams;
pub use stage::ImpairmentStage;
pub use stats::StatsSnapshot;
