//! Capture/inject dispatcher.
//!
//! Owns the diverter handle, the six impairment stages, the capture worker
//! threads, and one release worker per enabled time-based stage. The caller
//! thread drives the control plane (start/stop/setters/accessors); packets
//! flow worker → pipeline → batched inject without ever touching the caller.

mod release;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use release::ReleaseStage;
use tracing::{info, warn};

use crate::divert::{DivertHandle, DivertLayer, DivertParam, Diverter, VersionInfo};
use crate::observe::{ObservationRecord, ObservationRing};
use crate::params::CaptureParams;
use crate::stage::{
    BandwidthStage, DuplicateStage, ImpairmentStage, JitterStage, LatencyStage, LossStage,
    ReorderStage,
};
use crate::stats::{EngineStats, StatsSnapshot};

/// How long `stop` lets workers finish their current batch before the handle
/// closes.
const STOP_GRACE: Duration = Duration::from_millis(250);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the control plane and every worker thread.
pub(crate) struct EngineShared {
    pub(crate) diverter: Arc<dyn Diverter>,
    pub(crate) handle: RwLock<Option<Arc<dyn DivertHandle>>>,
    pub(crate) stop: AtomicBool,
    pub(crate) params: Mutex<CaptureParams>,
    pub(crate) stats: EngineStats,
    pub(crate) observations: ObservationRing,
    pub(crate) last_error: Mutex<Option<String>>,

    pub(crate) loss: LossStage,
    pub(crate) duplicate: DuplicateStage,
    pub(crate) reorder: ReorderStage,
    pub(crate) jitter: JitterStage,
    pub(crate) bandwidth: BandwidthStage,
    pub(crate) latency: LatencyStage,
}

impl EngineShared {
    pub(crate) fn current_handle(&self) -> Option<Arc<dyn DivertHandle>> {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_error(&self, message: String) {
        warn!("{message}");
        *lock(&self.last_error) = Some(message);
    }

    /// The stages in canonical order. Drops come first so nothing is copied
    /// or delayed for a packet that will not survive; duplication precedes
    /// reordering so copies can shuffle apart; reorder precedes the
    /// time-based stages so positions settle before scheduling; bandwidth
    /// shapes before the final additive latency.
    pub(crate) fn pipeline(&self) -> [&dyn ImpairmentStage; 6] {
        [
            &self.loss,
            &self.duplicate,
            &self.reorder,
            &self.jitter,
            &self.bandwidth,
            &self.latency,
        ]
    }
}

#[derive(Default)]
struct Threads {
    capture: Vec<JoinHandle<()>>,
    latency: Option<JoinHandle<()>>,
    jitter: Option<JoinHandle<()>>,
    bandwidth: Option<JoinHandle<()>>,
}

/// The impairment engine. One instance per diverter filter; all methods take
/// `&self`, so the engine can sit behind an `Arc` shared with a control
/// surface.
pub struct CaptureEngine {
    shared: Arc<EngineShared>,
    running: AtomicBool,
    threads: Mutex<Threads>,
}

impl CaptureEngine {
    pub fn new(diverter: Arc<dyn Diverter>) -> Self {
        let params = CaptureParams::default();
        let ring_capacity = params.ring_capacity;
        Self {
            shared: Arc::new(EngineShared {
                diverter,
                handle: RwLock::new(None),
                stop: AtomicBool::new(false),
                params: Mutex::new(params),
                stats: EngineStats::default(),
                observations: ObservationRing::new(ring_capacity),
                last_error: Mutex::new(None),
                loss: LossStage::new(),
                duplicate: DuplicateStage::new(),
                reorder: ReorderStage::new(),
                jitter: JitterStage::new(),
                bandwidth: BandwidthStage::new(),
                latency: LatencyStage::new(),
            }),
            running: AtomicBool::new(false),
            threads: Mutex::new(Threads::default()),
        }
    }

    /// Open the diverter with `filter` and begin capturing.
    ///
    /// Fails if already running, if any parameter is out of range, if the
    /// driver refuses the filter, or if a queue knob is rejected. On failure
    /// the engine is left idle.
    pub fn start(&self, filter: &str, params: CaptureParams) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            bail!("already capturing");
        }
        if let Err(err) = self.start_inner(filter, params) {
            self.running.store(false, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    fn start_inner(&self, filter: &str, params: CaptureParams) -> Result<()> {
        params.validate()?;

        let handle = self
            .shared
            .diverter
            .open(filter, DivertLayer::Network, 0)
            .context("open diverter")?;

        for (param, value) in [
            (DivertParam::QueueLength, params.queue_length),
            (DivertParam::QueueTime, params.queue_time_ms),
            (DivertParam::QueueBytes, params.queue_bytes),
        ] {
            if !handle.set_param(param, value) {
                handle.close();
                bail!("diverter rejected {param:?} = {value}");
            }
        }

        self.shared.observations.set_capacity(params.ring_capacity);
        self.shared.stats.reset();
        self.shared.stop.store(false, Ordering::SeqCst);
        *lock(&self.shared.params) = params.clone();
        *self
            .shared
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let mut threads = lock(&self.threads);
        threads.capture.reserve(params.worker_threads as usize);
        for worker_id in 0..params.worker_threads {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("capture-{worker_id}"))
                .spawn(move || worker::capture_worker(shared, worker_id))
                .context("spawn capture worker")?;
            threads.capture.push(handle);
        }

        for which in [
            ReleaseStage::Latency,
            ReleaseStage::Jitter,
            ReleaseStage::Bandwidth,
        ] {
            if which.stage(&self.shared).is_enabled() {
                Self::spawn_release_worker(&self.shared, &mut threads, which)?;
            }
        }

        info!(
            filter,
            workers = params.worker_threads,
            batch_size = params.batch_size,
            "capture started"
        );
        Ok(())
    }

    /// Stop capturing. Idempotent; never fails.
    ///
    /// Shuts down the receive side so blocked receives return, gives workers
    /// a grace period to finish their batch, closes the handle, joins every
    /// worker, and finally empties all stage buffers. The drained packets are
    /// discarded; the pipeline is over.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.shared.stop.store(true, Ordering::SeqCst);

        if let Some(handle) = self.shared.current_handle() {
            handle.shutdown_recv();
            thread::sleep(STOP_GRACE);
            handle.close();
        }
        *self
            .shared
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;

        let mut threads = lock(&self.threads);
        for worker in threads.capture.drain(..) {
            let _ = worker.join();
        }
        for worker in [
            threads.latency.take(),
            threads.jitter.take(),
            threads.bandwidth.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = worker.join();
        }

        self.shared.reorder.flush();
        self.shared.jitter.flush();
        self.shared.bandwidth.flush();
        self.shared.latency.flush();

        info!("capture stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // --- Loss ---

    pub fn set_loss_enabled(&self, enabled: bool) {
        self.shared.loss.set_enabled(enabled);
    }

    pub fn is_loss_enabled(&self) -> bool {
        self.shared.loss.is_enabled()
    }

    pub fn set_loss_rate(&self, rate: f32) {
        self.shared.loss.set_rate(rate);
    }

    pub fn loss_rate(&self) -> f32 {
        self.shared.loss.rate()
    }

    pub fn set_loss_inbound(&self, enabled: bool) {
        self.shared.loss.set_inbound(enabled);
    }

    pub fn set_loss_outbound(&self, enabled: bool) {
        self.shared.loss.set_outbound(enabled);
    }

    // --- Duplicate ---

    pub fn set_duplicate_enabled(&self, enabled: bool) {
        self.shared.duplicate.set_enabled(enabled);
    }

    pub fn is_duplicate_enabled(&self) -> bool {
        self.shared.duplicate.is_enabled()
    }

    pub fn set_duplicate_rate(&self, rate: f32) {
        self.shared.duplicate.set_rate(rate);
    }

    pub fn duplicate_rate(&self) -> f32 {
        self.shared.duplicate.rate()
    }

    pub fn set_duplicate_copies(&self, copies: u32) {
        self.shared.duplicate.set_copies(copies);
    }

    pub fn duplicate_copies(&self) -> u32 {
        self.shared.duplicate.copies()
    }

    pub fn set_duplicate_inbound(&self, enabled: bool) {
        self.shared.duplicate.set_inbound(enabled);
    }

    pub fn set_duplicate_outbound(&self, enabled: bool) {
        self.shared.duplicate.set_outbound(enabled);
    }

    // --- Reorder ---

    pub fn set_reorder_enabled(&self, enabled: bool) {
        self.shared.reorder.set_enabled(enabled);
    }

    pub fn is_reorder_enabled(&self) -> bool {
        self.shared.reorder.is_enabled()
    }

    pub fn set_reorder_rate(&self, rate: f32) {
        self.shared.reorder.set_rate(rate);
    }

    pub fn reorder_rate(&self) -> f32 {
        self.shared.reorder.rate()
    }

    pub fn set_reorder_gap(&self, gap: u32) {
        self.shared.reorder.set_gap(gap);
    }

    pub fn reorder_gap(&self) -> u32 {
        self.shared.reorder.gap()
    }

    pub fn set_reorder_inbound(&self, enabled: bool) {
        self.shared.reorder.set_inbound(enabled);
    }

    pub fn set_reorder_outbound(&self, enabled: bool) {
        self.shared.reorder.set_outbound(enabled);
    }

    // --- Jitter ---

    /// Enabling while capturing also brings up the jitter release worker if
    /// one is not already ticking.
    pub fn set_jitter_enabled(&self, enabled: bool) {
        self.shared.jitter.set_enabled(enabled);
        if enabled {
            self.ensure_release_worker(ReleaseStage::Jitter);
        }
    }

    pub fn is_jitter_enabled(&self) -> bool {
        self.shared.jitter.is_enabled()
    }

    pub fn set_jitter_range(&self, min_ms: u32, max_ms: u32) {
        self.shared.jitter.set_range(min_ms, max_ms);
    }

    pub fn jitter_min(&self) -> u32 {
        self.shared.jitter.min_ms()
    }

    pub fn jitter_max(&self) -> u32 {
        self.shared.jitter.max_ms()
    }

    pub fn set_jitter_inbound(&self, enabled: bool) {
        self.shared.jitter.set_inbound(enabled);
    }

    pub fn set_jitter_outbound(&self, enabled: bool) {
        self.shared.jitter.set_outbound(enabled);
    }

    // --- Latency ---

    pub fn set_latency_enabled(&self, enabled: bool) {
        self.shared.latency.set_enabled(enabled);
        if enabled {
            self.ensure_release_worker(ReleaseStage::Latency);
        }
    }

    pub fn is_latency_enabled(&self) -> bool {
        self.shared.latency.is_enabled()
    }

    pub fn set_latency(&self, delay_ms: u64) {
        self.shared.latency.set_delay_ms(delay_ms);
    }

    pub fn latency(&self) -> u64 {
        self.shared.latency.delay_ms()
    }

    pub fn set_latency_inbound(&self, enabled: bool) {
        self.shared.latency.set_inbound(enabled);
    }

    pub fn set_latency_outbound(&self, enabled: bool) {
        self.shared.latency.set_outbound(enabled);
    }

    // --- Bandwidth ---

    pub fn set_bandwidth_enabled(&self, enabled: bool) {
        self.shared.bandwidth.set_enabled(enabled);
        if enabled {
            self.ensure_release_worker(ReleaseStage::Bandwidth);
        }
    }

    pub fn is_bandwidth_enabled(&self) -> bool {
        self.shared.bandwidth.is_enabled()
    }

    pub fn set_bandwidth_kbps(&self, kbps: u32) {
        self.shared.bandwidth.set_kbps(kbps);
    }

    pub fn bandwidth_kbps(&self) -> u32 {
        self.shared.bandwidth.kbps()
    }

    pub fn set_bandwidth_inbound(&self, enabled: bool) {
        self.shared.bandwidth.set_inbound(enabled);
    }

    pub fn set_bandwidth_outbound(&self, enabled: bool) {
        self.shared.bandwidth.set_outbound(enabled);
    }

    // --- Runtime diverter knobs ---

    /// Forward a queue-length change to the driver. False means the driver
    /// rejected it (or no capture is active); the cached parameters only
    /// update on success.
    pub fn set_queue_length(&self, length: u64) -> bool {
        self.set_divert_param(DivertParam::QueueLength, length, |params| {
            params.queue_length = length;
        })
    }

    pub fn set_queue_time(&self, time_ms: u64) -> bool {
        self.set_divert_param(DivertParam::QueueTime, time_ms, |params| {
            params.queue_time_ms = time_ms;
        })
    }

    pub fn set_queue_bytes(&self, bytes: u64) -> bool {
        self.set_divert_param(DivertParam::QueueBytes, bytes, |params| {
            params.queue_bytes = bytes;
        })
    }

    fn set_divert_param(
        &self,
        param: DivertParam,
        value: u64,
        apply: impl FnOnce(&mut CaptureParams),
    ) -> bool {
        let Some(handle) = self.shared.current_handle() else {
            return false;
        };
        if !handle.set_param(param, value) {
            return false;
        }
        apply(&mut lock(&self.shared.params));
        true
    }

    // --- Accessors ---

    pub fn params(&self) -> CaptureParams {
        lock(&self.shared.params).clone()
    }

    pub fn driver_version(&self) -> VersionInfo {
        let Some(handle) = self.shared.current_handle() else {
            return VersionInfo::default();
        };
        VersionInfo {
            major: handle.get_param(DivertParam::VersionMajor).unwrap_or(0),
            minor: handle.get_param(DivertParam::VersionMinor).unwrap_or(0),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Drain the observation ring in capture order.
    pub fn take_observations(&self) -> Vec<ObservationRecord> {
        self.shared.observations.take_all()
    }

    /// Resize the observation ring; takes effect on the next capture.
    pub fn set_observation_capacity(&self, capacity: usize) {
        self.shared.observations.set_capacity(capacity);
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    fn ensure_release_worker(&self, which: ReleaseStage) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let mut threads = lock(&self.threads);
        if let Err(err) = Self::spawn_release_worker(&self.shared, &mut threads, which) {
            self.shared.set_error(format!("{err:#}"));
        }
    }

    fn spawn_release_worker(
        shared: &Arc<EngineShared>,
        threads: &mut Threads,
        which: ReleaseStage,
    ) -> Result<()> {
        let slot = match which {
            ReleaseStage::Latency => &mut threads.latency,
            ReleaseStage::Jitter => &mut threads.jitter,
            ReleaseStage::Bandwidth => &mut threads.bandwidth,
        };
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        let shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-release", which.name()))
            .spawn(move || release::release_worker(shared, which))
            .with_context(|| format!("spawn {} release worker", which.name()))?;
        *slot = Some(handle);
        Ok(())
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
