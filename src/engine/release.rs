//! Release workers for the time-based stages.
//!
//! One thread per enabled stage ticks every 10 ms, drains whatever came due,
//! and injects it exactly like a capture worker would. Release workers never
//! call `process_batch`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::debug;

use super::EngineShared;
use super::worker::inject_batch;
use crate::stage::ImpairmentStage;

pub(crate) const RELEASE_TICK: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReleaseStage {
    Latency,
    Jitter,
    Bandwidth,
}

impl ReleaseStage {
    pub(crate) fn name(self) -> &'static str {
        match self {
            ReleaseStage::Latency => "latency",
            ReleaseStage::Jitter => "jitter",
            ReleaseStage::Bandwidth => "bandwidth",
        }
    }

    pub(crate) fn stage(self, shared: &EngineShared) -> &dyn ImpairmentStage {
        match self {
            ReleaseStage::Latency => &shared.latency,
            ReleaseStage::Jitter => &shared.jitter,
            ReleaseStage::Bandwidth => &shared.bandwidth,
        }
    }
}

pub(crate) fn release_worker(shared: Arc<EngineShared>, which: ReleaseStage) {
    debug!(stage = which.name(), "release worker started");

    while !shared.stop.load(std::sync::atomic::Ordering::Relaxed) {
        thread::sleep(RELEASE_TICK);

        let due = which.stage(&shared).drain_due();
        if due.is_empty() {
            continue;
        }
        let Some(handle) = shared.current_handle() else {
            continue;
        };
        inject_batch(&shared, handle.as_ref(), due);
    }

    debug!(stage = which.name(), "release worker stopped");
}
