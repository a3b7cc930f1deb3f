//! The acquisition engine: owns the free pool, Q1/Q2, the three worker
//! threads, the EOF ingress, and the abort/stop protocol.
//!
//! Grounded on the control-flow description in the system overview and
//! on the per-worker algorithms in the component design: the acquisition
//! worker's ordered checks (copy, staleness, duplicate/out-of-order,
//! gap-fill) are implemented in exactly that order so the concrete
//! end-to-end scenarios (gap introduction, out-of-order drop) reproduce
//! the documented counters bit-for-bit. Threading primitives are
//! `std::sync::{Mutex, Condvar}` (via [`BoundedQueue`]) for the
//! queues and `parking_lot::Mutex` for the engine's own small scalar
//! state, matching the rest of this crate.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::driver::{AcqStatus, CameraDriver};
use crate::error::{AcqError, AcqResult};
use crate::fps_limiter::FpsLimiter;
use crate::frame::{AcqCfg, Frame};
use crate::gap::{GapTracker, Range};
use crate::pool::{initial_pool_size, FramePool};
use crate::prd::{PrdHeader, PrdMetaData, PrdWriter, Region, TrajectoryLayout};
use crate::queue::{BoundedQueue, DropPolicy, PushOutcome};
use crate::settings::{Settings, StorageType};
use crate::sysinfo::{self, MemoryTotals};
use crate::tiff::TiffStackWriter;

const FOUR_GIB: u64 = 4 * 1024 * 1024 * 1024;
const REPORTER_PERIOD: Duration = Duration::from_millis(500);
const Q1_POP_TIMEOUT: Duration = Duration::from_secs(5);

/// `max(128, min(2*phys_total, virt_total - 4 GiB) / frame_bytes)`.
fn compute_q2_max(mem: MemoryTotals, frame_bytes: u32) -> usize {
    let frame_bytes = u64::from(frame_bytes.max(1));
    let by_mem = (2 * mem.phys_total).min(mem.virt_total.saturating_sub(FOUR_GIB)) / frame_bytes;
    128usize.max(by_mem as usize)
}

/// The engine's coarse lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No device configured yet.
    Idle,
    /// `setup_exp` succeeded; ready to `start`.
    Ready,
    /// Worker threads and the driver's EOF delivery are live.
    Running,
    /// `wait_for_stop` is joining threads.
    Stopping,
}

#[derive(Default)]
struct Counters {
    caught: AtomicU64,
    latest_received: AtomicU32,
    last_processed: AtomicU32,
    out_of_order: AtomicU64,
    valid_processed: AtomicU64,
    saved: AtomicU64,
    unsaved_lost: AtomicU64,
    bytes_saved: AtomicU64,
}

#[derive(Default)]
struct Threads {
    acq_worker: Option<JoinHandle<()>>,
    disk_worker: Option<JoinHandle<()>>,
    reporter: Option<JoinHandle<()>>,
}

/// One worker-stage row of the end-of-run report.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageStats {
    /// Frames this stage successfully carried through.
    pub frame_count: u64,
    /// Frames this stage lost.
    pub lost_count: u64,
    /// `lost_count / (frame_count + lost_count) * 100`.
    pub lost_percent: f64,
    /// Average spacing between drop ranges, per the gap tracker's law.
    pub avg_spacing: f64,
    /// Longest contiguous run of drops.
    pub longest_drop_run: u32,
    /// Highest occupancy this stage's queue ever reached.
    pub peak_queue_size: usize,
    /// This stage's queue capacity at report time.
    pub max_queue_size: usize,
    /// Frames per second over the run's wall-clock duration.
    pub fps: f64,
    /// Throughput in MiB/s over the run's wall-clock duration.
    pub mib_per_sec: f64,
}

/// The full end-of-run report: one table for each of the acquisition and
/// disk stages.
#[derive(Debug, Clone, Copy)]
pub struct RunReport {
    /// Whether the run ended via `request_abort` rather than naturally.
    pub aborted: bool,
    /// Acquisition-stage statistics.
    pub acq: StageStats,
    /// Disk-stage statistics.
    pub disk: StageStats,
}

/// Owns Q1/Q2, the free pool, the three worker threads, the EOF ingress,
/// and the abort/stop protocol for one camera driver.
pub struct Engine {
    state: Mutex<EngineState>,
    settings: Arc<Settings>,
    driver: Mutex<Box<dyn CameraDriver>>,
    acq_cfg: AcqCfg,
    q1: Arc<BoundedQueue<Frame>>,
    q2: Arc<BoundedQueue<Frame>>,
    pool: Arc<FramePool>,
    counters: Counters,
    acq_gaps: Mutex<GapTracker>,
    disk_gaps: Mutex<GapTracker>,
    acq_abort: AtomicBool,
    disk_abort: AtomicBool,
    acq_done: AtomicBool,
    disk_done: AtomicBool,
    threads: Mutex<Threads>,
    fps_limiter: Mutex<Option<Arc<FpsLimiter<Frame>>>>,
    start_instant: Mutex<Option<Instant>>,
}

impl Engine {
    /// Initializes `driver`, opens its first camera, negotiates
    /// `settings` against it, and sizes Q1/Q2/the free pool. Leaves the
    /// engine in [`EngineState::Ready`].
    pub fn new(mut driver: Box<dyn CameraDriver>, mut settings: Settings) -> AcqResult<Arc<Self>> {
        driver.init()?;
        if driver.count() > 0 {
            let name = driver.name_at(0)?;
            driver.open(&name)?;
        }

        if settings.max_stack_size() != 0 && settings.max_stack_size() < 2 {
            return Err(AcqError::StackTooSmall(settings.max_stack_size() as u32));
        }

        let frame_bytes = driver.setup_exp(&settings)?;
        if frame_bytes == 0 {
            return Err(AcqError::ConfigInvalid(
                "driver negotiated frame_bytes == 0".to_string(),
            ));
        }

        let acq_cfg = AcqCfg {
            frame_bytes,
            roi_count: settings.roi_count_max(),
            has_metadata: settings.metadata_capable(),
        };

        let device_ring = driver.get_max_buffered_frames();
        let q1_max = device_ring.saturating_sub(2).max(1) as usize;

        let mem = sysinfo::memory_totals();
        let q2_max = compute_q2_max(mem, frame_bytes);

        let pool_size = initial_pool_size(settings.acq_frame_count(), frame_bytes, q2_max);
        let pool = Arc::new(FramePool::new(acq_cfg, true, pool_size));

        let q1 = Arc::new(BoundedQueue::new(q1_max, DropPolicy::Oldest));
        let q2 = Arc::new(BoundedQueue::new(q2_max, DropPolicy::Newest));

        settings.set_buffer_frame_count(device_ring);
        let settings = settings.setup();

        Ok(Arc::new(Self {
            state: Mutex::new(EngineState::Ready),
            settings,
            driver: Mutex::new(driver),
            acq_cfg,
            q1,
            q2,
            pool,
            counters: Counters::default(),
            acq_gaps: Mutex::new(GapTracker::new()),
            disk_gaps: Mutex::new(GapTracker::new()),
            acq_abort: AtomicBool::new(false),
            disk_abort: AtomicBool::new(false),
            acq_done: AtomicBool::new(false),
            disk_done: AtomicBool::new(false),
            threads: Mutex::new(Threads::default()),
            fps_limiter: Mutex::new(None),
            start_instant: Mutex::new(None),
        }))
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Attaches an FPS limiter (replacing any previous one) and starts
    /// its worker thread with `callback`. Harmless to call before
    /// `start`; the acquisition worker only feeds it once running.
    pub fn attach_fps_limiter<Cb>(&self, callback: Cb)
    where
        Cb: FnMut(Option<Frame>) + Send + 'static,
    {
        let limiter = FpsLimiter::new();
        limiter.start(callback);
        *self.fps_limiter.lock() = Some(limiter);
    }

    /// Spawns the three worker threads and starts the driver's
    /// acquisition. Transitions `Ready -> Running`, or back to `Idle` on
    /// `start_exp` failure.
    pub fn start(self: &Arc<Self>) -> AcqResult<()> {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Ready {
                return Err(AcqError::ConfigInvalid(
                    "start() called outside the Ready state".to_string(),
                ));
            }
            *state = EngineState::Running;
        }
        *self.start_instant.lock() = Some(Instant::now());

        let acq_self = Arc::clone(self);
        let acq_handle = thread::Builder::new()
            .name("acq-worker".to_string())
            .spawn(move || acq_self.acq_worker_loop())
            .expect("spawning the acquisition worker should not fail");

        let disk_self = Arc::clone(self);
        let disk_handle = thread::Builder::new()
            .name("disk-worker".to_string())
            .spawn(move || disk_self.disk_worker_loop())
            .expect("spawning the disk worker should not fail");

        let reporter_self = Arc::clone(self);
        let reporter_handle = thread::Builder::new()
            .name("reporter".to_string())
            .spawn(move || reporter_self.reporter_loop())
            .expect("spawning the reporter should not fail");

        {
            let mut threads = self.threads.lock();
            threads.acq_worker = Some(acq_handle);
            threads.disk_worker = Some(disk_handle);
            threads.reporter = Some(reporter_handle);
        }

        let ingress_self = Arc::clone(self);
        let callback = Box::new(move |info| ingress_self.eof_ingress(info));
        let started = self.driver.lock().start_exp(callback);
        if let Err(e) = started {
            *self.state.lock() = EngineState::Idle;
            self.request_abort(true);
            return Err(e);
        }
        Ok(())
    }

    /// Latches the abort protocol. `preserve_buffered = true` stops
    /// device-side ingress but lets the disk worker drain whatever is
    /// already in Q2; `false` discards Q2 outright.
    pub fn request_abort(&self, preserve_buffered: bool) {
        self.acq_abort.store(true, Ordering::Relaxed);
        self.q1.notify_abort();
        if !preserve_buffered {
            self.disk_abort.store(true, Ordering::Relaxed);
            self.q2.notify_abort();
        }
    }

    /// Joins all three worker threads (in order), stops the driver,
    /// reports end-of-run statistics, preallocates the pool for the next
    /// run, and returns to `Idle`.
    pub fn wait_for_stop(&self) -> AcqResult<RunReport> {
        *self.state.lock() = EngineState::Stopping;
        let (acq, disk, reporter) = {
            let mut threads = self.threads.lock();
            (
                threads.acq_worker.take(),
                threads.disk_worker.take(),
                threads.reporter.take(),
            )
        };
        let had_all_three = acq.is_some() && disk.is_some() && reporter.is_some();
        if let Some(h) = acq {
            let _ = h.join();
        }
        if let Some(h) = disk {
            let _ = h.join();
        }
        if let Some(h) = reporter {
            let _ = h.join();
        }

        if let Err(e) = self.driver.lock().stop_exp() {
            tracing::warn!(error = %e, "stop_exp failed during teardown");
        }

        let elapsed = self
            .start_instant
            .lock()
            .map_or(Duration::ZERO, |i| i.elapsed());
        let aborted = self.acq_abort.load(Ordering::Relaxed);
        let acq_stats = self.acq_stage_stats(elapsed);
        let disk_stats = self.disk_stage_stats(elapsed);

        self.pool.mark_acquisition_over();
        let pool_target =
            initial_pool_size(self.settings.acq_frame_count(), self.acq_cfg.frame_bytes, self.q2.capacity());
        self.pool.preallocate(self.acq_cfg, true, pool_target);

        *self.state.lock() = EngineState::Idle;

        if had_all_three {
            if aborted {
                tracing::info!("Acquisition stopped");
            } else {
                tracing::info!("Acquisition finished");
            }
        }

        Ok(RunReport {
            aborted,
            acq: acq_stats,
            disk: disk_stats,
        })
    }

    fn acq_stage_stats(&self, elapsed: Duration) -> StageStats {
        let (lost, longest, avg_spacing) = {
            let mut gaps = self.acq_gaps.lock();
            (gaps.count(), gaps.largest_cluster(), gaps.avg_spacing())
        };
        let frame_count = self.counters.valid_processed.load(Ordering::Relaxed);
        stage_stats(frame_count, lost, longest, avg_spacing, &self.q1, self.acq_cfg, elapsed)
    }

    fn disk_stage_stats(&self, elapsed: Duration) -> StageStats {
        let (_, longest, avg_spacing) = {
            let mut gaps = self.disk_gaps.lock();
            (gaps.count(), gaps.largest_cluster(), gaps.avg_spacing())
        };
        let frame_count = self.counters.saved.load(Ordering::Relaxed);
        let lost = self.counters.unsaved_lost.load(Ordering::Relaxed);
        let mut s = stage_stats(frame_count, lost, longest, avg_spacing, &self.q2, self.acq_cfg, elapsed);
        let bytes = self.counters.bytes_saved.load(Ordering::Relaxed);
        let secs = elapsed.as_secs_f64().max(1e-9);
        s.mib_per_sec = bytes as f64 / (1024.0 * 1024.0) / secs;
        s
    }

    /// Number of frames the acquisition worker accepted as valid, in
    /// processing order.
    #[must_use]
    pub fn valid_processed(&self) -> u64 {
        self.counters.valid_processed.load(Ordering::Relaxed)
    }

    /// Number of frames dropped for arriving out of order or duplicated.
    #[must_use]
    pub fn out_of_order(&self) -> u64 {
        self.counters.out_of_order.load(Ordering::Relaxed)
    }

    /// The highest frame number the acquisition worker has accepted.
    #[must_use]
    pub fn last_processed(&self) -> u32 {
        self.counters.last_processed.load(Ordering::Relaxed)
    }

    /// Frames actually written to disk.
    #[must_use]
    pub fn saved(&self) -> u64 {
        self.counters.saved.load(Ordering::Relaxed)
    }

    /// Frames that reached Q2 but were dropped before being saved
    /// (queue overflow only; intentional save-policy skips are not
    /// counted here).
    #[must_use]
    pub fn unsaved_lost(&self) -> u64 {
        self.counters.unsaved_lost.load(Ordering::Relaxed)
    }

    /// Total count of lost frame numbers on the acquisition side, per
    /// the gap tracker.
    pub fn acq_lost(&self) -> u64 {
        self.acq_gaps.lock().count()
    }

    /// The acquisition-side gap tracker's current coalesced ranges.
    pub fn acq_gap_ranges(&self) -> Vec<Range> {
        self.acq_gaps.lock().ranges().to_vec()
    }

    fn eof_ingress(&self, info: Option<crate::frame::FrameInfo>) {
        if self.acq_abort.load(Ordering::Relaxed) {
            return;
        }
        let Some(info) = info else {
            tracing::error!("device reported a failure (null frame_info)");
            self.request_abort(true);
            return;
        };
        self.counters
            .latest_received
            .fetch_max(info.frame_nr, Ordering::Relaxed);
        self.counters.caught.fetch_add(1, Ordering::Relaxed);

        let mut frame = self.pool.draw();
        let got = self.driver.lock().get_latest_frame(&mut frame);
        if let Err(e) = got {
            tracing::error!(error = %e, "get_latest_frame failed");
            self.pool.give_back(frame);
            self.request_abort(true);
            return;
        }

        match self.q1.try_push(frame) {
            PushOutcome::Pushed => {}
            PushOutcome::DroppedOldest(evicted) => {
                if let Some(evicted) = evicted {
                    self.pool.give_back(evicted);
                }
            }
            PushOutcome::DroppedNewest(_) => unreachable!("Q1 always uses DropPolicy::Oldest"),
        }
    }

    fn acq_worker_loop(&self) {
        loop {
            if self.should_stop_acq_loop() {
                break;
            }
            match self.q1.pop_timeout(Q1_POP_TIMEOUT) {
                None => {
                    if self.acq_abort.load(Ordering::Relaxed) {
                        break;
                    }
                    let status = self.driver.lock().acq_status();
                    if status != AcqStatus::Active {
                        tracing::warn!("driver inactive while waiting on Q1; aborting");
                        self.request_abort(true);
                    }
                }
                Some(mut frame) => self.process_acquired_frame(&mut frame),
            }
        }
        self.acq_done.store(true, Ordering::Relaxed);
    }

    fn should_stop_acq_loop(&self) -> bool {
        if self.acq_abort.load(Ordering::Relaxed) && self.q1.is_empty() {
            return true;
        }
        if !self.settings.acq_mode().is_live() {
            let target = u64::from(self.settings.acq_frame_count());
            if target > 0
                && self.counters.valid_processed.load(Ordering::Relaxed) >= target
                && self.q1.is_empty()
            {
                return true;
            }
        }
        false
    }

    fn process_acquired_frame(&self, frame: &mut Frame) {
        if let Err(e) = frame.copy_data() {
            if let AcqError::FrameCopyFail { frame_nr, reason } = &e {
                tracing::warn!(frame_nr, %reason, "frame copy failed");
                self.acq_gaps.lock().add(*frame_nr);
            }
            let placeholder = Frame::new(self.acq_cfg, false);
            self.pool.give_back(std::mem::replace(frame, placeholder));
            self.request_abort(true);
            return;
        }

        let frame_nr = frame.info().expect("copy_data succeeded").frame_nr;
        let q1_max = self.q1.capacity() as u64;
        let latest_received = u64::from(self.counters.latest_received.load(Ordering::Relaxed));
        if u64::from(frame_nr) + q1_max <= latest_received {
            tracing::debug!(frame_nr, latest_received, "frame went stale before copy");
            self.acq_gaps.lock().add(frame_nr);
            self.return_frame(frame);
            return;
        }

        let last_processed = self.counters.last_processed.load(Ordering::Relaxed);
        if frame_nr <= last_processed {
            self.counters.out_of_order.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(frame_nr, last_processed, "frame out of order, dropping");
            self.return_frame(frame);
            return;
        }

        if last_processed != 0 && frame_nr > last_processed + 1 {
            self.acq_gaps
                .lock()
                .add_range(last_processed + 1, frame_nr - 1);
        }
        self.counters
            .last_processed
            .store(frame_nr, Ordering::Relaxed);
        self.counters.valid_processed.fetch_add(1, Ordering::Relaxed);

        if let Some(limiter) = self.fps_limiter.lock().as_ref() {
            limiter.input_new_frame(frame.duplicate(true));
        }

        let to_push = std::mem::replace(frame, Frame::new(self.acq_cfg, false));
        match self.q2.try_push(to_push) {
            PushOutcome::Pushed => {}
            PushOutcome::DroppedNewest(mut returned) => {
                self.counters.unsaved_lost.fetch_add(1, Ordering::Relaxed);
                self.disk_gaps.lock().add(frame_nr);
                returned.invalidate();
                self.pool.give_back(returned);
            }
            PushOutcome::DroppedOldest(_) => unreachable!("Q2 always uses DropPolicy::Newest"),
        }
        // `*frame` now holds a throwaway placeholder (it was either
        // moved into Q2 above, or handed back to the pool): nothing
        // left to recycle, it simply drops with the caller's binding.
    }

    fn return_frame(&self, frame: &mut Frame) {
        frame.invalidate();
        let placeholder = Frame::new(self.acq_cfg, false);
        self.pool.give_back(std::mem::replace(frame, placeholder));
    }

    fn disk_worker_loop(&self) {
        let mut state = DiskState::new(&self.settings, self.acq_cfg);
        let mut frame_index: usize = 0;
        loop {
            if self.disk_abort.load(Ordering::Relaxed) {
                break;
            }
            match self.q2.pop_wait() {
                None => {
                    if self.acq_done.load(Ordering::Relaxed) && self.q2.is_empty() {
                        break;
                    }
                }
                Some(mut frame) => {
                    if frame.needs_decode() {
                        if let Err(e) = frame.decode_metadata() {
                            tracing::warn!(error = %e, "metadata decode failed, dropping frame");
                            self.pool.give_back(frame);
                            frame_index += 1;
                            continue;
                        }
                    }
                    match state.handle_frame(&self.settings, frame_index, &frame) {
                        Ok(Some(bytes)) => {
                            self.counters.saved.fetch_add(1, Ordering::Relaxed);
                            self.counters.bytes_saved.fetch_add(bytes, Ordering::Relaxed);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "disk write failed, aborting");
                            frame.invalidate();
                            self.pool.give_back(frame);
                            self.request_abort(true);
                            frame_index += 1;
                            break;
                        }
                    }
                    frame.invalidate();
                    self.pool.give_back(frame);
                    frame_index += 1;
                }
            }
        }
        if let Err(e) = state.close_all() {
            tracing::error!(error = %e, "failed to finalize an open stack file");
        }
        self.disk_done.store(true, Ordering::Relaxed);
    }

    fn reporter_loop(&self) {
        const SPINNER: [char; 4] = ['|', '/', '-', '\\'];
        let mut tick: u64 = 0;
        loop {
            thread::sleep(REPORTER_PERIOD);
            tick += 1;

            if tick % 8 == 0 && !self.acq_done.load(Ordering::Relaxed) {
                let mem = sysinfo::memory_totals();
                self.q2.set_capacity(compute_q2_max(mem, self.acq_cfg.frame_bytes));
            }

            let caught = self.counters.caught.load(Ordering::Relaxed);
            let lost = self.acq_gaps.lock().count();
            let queued = self.q1.len();
            let dropped = self.q1.lost();
            let processed = self.counters.valid_processed.load(Ordering::Relaxed);
            let saved = self.counters.saved.load(Ordering::Relaxed);

            let suffix = if self.acq_abort.load(Ordering::Relaxed) {
                if self.disk_abort.load(Ordering::Relaxed) {
                    ", aborting..."
                } else {
                    ", finishing..."
                }
            } else {
                ""
            };
            let lost_part = if lost > 0 {
                format!(" ({lost} lost)")
            } else {
                String::new()
            };
            let dropped_part = if dropped > 0 {
                format!(" ({dropped} dropped)")
            } else {
                String::new()
            };

            print!(
                "\r{} so far caught {caught} frames{lost_part}, {queued} queued for processing{dropped_part}, {processed} processed, {saved} saved{suffix}",
                SPINNER[(tick as usize) % SPINNER.len()],
            );
            let _ = std::io::stdout().flush();

            if self.acq_done.load(Ordering::Relaxed) && self.disk_done.load(Ordering::Relaxed) {
                println!();
                break;
            }
        }
    }
}

fn stage_stats(
    frame_count: u64,
    lost: u64,
    longest_drop_run: u32,
    avg_spacing: f64,
    queue: &BoundedQueue<Frame>,
    acq_cfg: AcqCfg,
    elapsed: Duration,
) -> StageStats {
    let total = frame_count + lost;
    let lost_percent = if total > 0 {
        (lost as f64 / total as f64) * 100.0
    } else {
        0.0
    };
    let secs = elapsed.as_secs_f64().max(1e-9);
    StageStats {
        frame_count,
        lost_count: lost,
        lost_percent,
        avg_spacing,
        longest_drop_run,
        peak_queue_size: queue.peak(),
        max_queue_size: queue.capacity(),
        fps: frame_count as f64 / secs,
        mib_per_sec: (frame_count * u64::from(acq_cfg.frame_bytes)) as f64 / (1024.0 * 1024.0) / secs,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveBucket {
    All,
    First,
    Last,
    Drop,
}

/// Implements §4.7's save-first/save-last policy, including the
/// unnormalized overlap comparison preserved verbatim from the source
/// this engine is grounded on (see DESIGN.md).
fn classify(
    frame_index: usize,
    total: Option<usize>,
    save_first: usize,
    save_last: usize,
    is_live: bool,
) -> SaveBucket {
    let save_last_eff = if is_live { 0 } else { save_last };
    if save_first == 0 && save_last_eff == 0 {
        return SaveBucket::All;
    }
    if let Some(total) = total {
        if !is_live && save_first >= total.saturating_sub(save_last_eff) {
            return SaveBucket::All;
        }
    }
    if save_first > 0 && frame_index < save_first {
        return SaveBucket::First;
    }
    if let Some(total) = total {
        if save_last_eff > 0 && frame_index >= total.saturating_sub(save_last_eff) {
            return SaveBucket::Last;
        }
    }
    SaveBucket::Drop
}

enum FileWriter {
    Prd(PrdWriter<File>),
    Tiff(TiffStackWriter<File>),
}

impl FileWriter {
    fn write(&mut self, frame: &Frame, header: &PrdHeader, meta: PrdMetaData) -> AcqResult<u64> {
        match self {
            FileWriter::Prd(w) => {
                w.write_frame(meta, frame.trajectories(), None, frame.data())?;
            }
            FileWriter::Tiff(w) => {
                w.write_frame(frame, header, &meta)?;
            }
        }
        Ok(frame.data().len() as u64)
    }

    fn close(self) -> AcqResult<()> {
        match self {
            FileWriter::Prd(w) => {
                w.close()?;
            }
            FileWriter::Tiff(_) => {}
        }
        Ok(())
    }
}

#[derive(Default)]
struct GroupState {
    stack_idx: u64,
    frames_in_stack: u32,
    writer: Option<FileWriter>,
}

/// Disk-worker-owned state: which stack each save bucket is currently
/// writing into. Not shared; lives entirely on the disk worker thread.
struct DiskState {
    storage_type: StorageType,
    max_stack_size: u32,
    save_dir: PathBuf,
    acq_cfg: AcqCfg,
    layout: TrajectoryLayout,
    all: GroupState,
    first: GroupState,
    last: GroupState,
}

impl DiskState {
    fn new(settings: &Settings, acq_cfg: AcqCfg) -> Self {
        Self {
            storage_type: settings.storage_type(),
            max_stack_size: settings.max_stack_size() as u32,
            save_dir: settings.save_dir().to_path_buf(),
            acq_cfg,
            layout: TrajectoryLayout::default(),
            all: GroupState::default(),
            first: GroupState::default(),
            last: GroupState::default(),
        }
    }

    fn ext(&self) -> &'static str {
        match self.storage_type {
            StorageType::Prd => "prd",
            StorageType::Tiff => "tiff",
            StorageType::None => "",
        }
    }

    fn file_path(&self, bucket: &str, idx: u64) -> PathBuf {
        let dir = if self.save_dir.as_os_str().is_empty() {
            Path::new(".").to_path_buf()
        } else {
            self.save_dir.clone()
        };
        let ext = self.ext();
        let name = if bucket.is_empty() {
            format!("ss_single_{idx}.{ext}")
        } else if bucket == "all" {
            format!("ss_stack_{idx}.{ext}")
        } else {
            format!("ss_stack_{bucket}_{idx}.{ext}")
        };
        dir.join(name)
    }

    fn header_for(&self, settings: &Settings, frame_count: u32) -> PrdHeader {
        PrdHeader {
            version: 0x0005,
            bit_depth: settings.bit_depth(),
            frame_count,
            region: Region {
                s1: 0,
                s2: settings.width().saturating_sub(1),
                sbin: 1,
                p1: 0,
                p2: settings.height().saturating_sub(1),
                pbin: 1,
            },
            size_of_meta_struct: 48 + self.layout.block_bytes(),
            exposure_resolution: settings.exposure_resolution(),
            color_mask: settings.color_mask(),
            has_metadata: settings.metadata_capable(),
            frame_size_varies: false,
            frame_size: self.acq_cfg.frame_bytes,
        }
    }

    fn build_meta(&self, frame: &Frame, settings: &Settings) -> PrdMetaData {
        let info = frame.info().unwrap_or_default();
        PrdMetaData {
            frame_number: info.frame_nr,
            readout_time: info.readout_time() as u32,
            exposure_time: settings.exposure_for_frame(info.frame_nr),
            timestamp_bof: info.timestamp_bof,
            timestamp_eof: info.timestamp_eof,
            roi_count: frame.metadata().rois.len() as u16,
            has_trajectories: frame.trajectories().is_some(),
            ext_md_size: self.layout.block_bytes(),
            ext_dyn_md_size: 0,
        }
    }

    fn open_writer(&self, path: &Path, settings: &Settings, frame_count: u32) -> AcqResult<FileWriter> {
        let file = File::create(path).map_err(|source| AcqError::FileIo {
            path: path.to_path_buf(),
            source,
        })?;
        match self.storage_type {
            StorageType::Prd => {
                let header = self.header_for(settings, frame_count);
                Ok(FileWriter::Prd(PrdWriter::new(file, header, self.layout)))
            }
            StorageType::Tiff => Ok(FileWriter::Tiff(TiffStackWriter::new(
                file,
                u32::from(settings.width()),
                u32::from(settings.height()),
            )?)),
            StorageType::None => unreachable!("handle_frame short-circuits on StorageType::None"),
        }
    }

    /// Writes one frame if the save policy selects it. Returns the byte
    /// count written, or `None` if this frame was intentionally skipped.
    fn handle_frame(
        &mut self,
        settings: &Settings,
        frame_index: usize,
        frame: &Frame,
    ) -> AcqResult<Option<u64>> {
        if self.storage_type == StorageType::None {
            return Ok(None);
        }
        let is_live = settings.acq_mode().is_live();
        let total = if is_live {
            None
        } else {
            let t = settings.acq_frame_count();
            if t > 0 {
                Some(t as usize)
            } else {
                None
            }
        };
        let bucket = classify(
            frame_index,
            total,
            settings.save_first(),
            settings.save_last(),
            is_live,
        );
        let group = match bucket {
            SaveBucket::Drop => return Ok(None),
            SaveBucket::All => "all",
            SaveBucket::First => "first",
            SaveBucket::Last => "last",
        };

        if self.max_stack_size == 0 {
            let frame_nr = frame.info().map_or(0, |i| i.frame_nr);
            let path = self.file_path("", u64::from(frame_nr));
            let header = self.header_for(settings, 1);
            let meta = self.build_meta(frame, settings);
            let mut writer = self.open_writer(&path, settings, 1)?;
            let bytes = writer.write(frame, &header, meta)?;
            writer.close()?;
            return Ok(Some(bytes));
        }

        let group_state = match bucket {
            SaveBucket::All => &mut self.all,
            SaveBucket::First => &mut self.first,
            SaveBucket::Last => &mut self.last,
            SaveBucket::Drop => unreachable!(),
        };
        if group_state.writer.is_none() {
            let path_idx = group_state.stack_idx;
            let path = self.file_path(group, path_idx);
            group_state.writer = Some(self.open_writer(&path, settings, self.max_stack_size)?);
        }
        let header = self.header_for(settings, self.max_stack_size);
        let meta = self.build_meta(frame, settings);
        let bytes = group_state
            .writer
            .as_mut()
            .expect("just ensured Some above")
            .write(frame, &header, meta)?;
        group_state.frames_in_stack += 1;
        if group_state.frames_in_stack >= self.max_stack_size {
            let writer = group_state.writer.take().expect("just wrote through it");
            writer.close()?;
            group_state.stack_idx += 1;
            group_state.frames_in_stack = 0;
        }
        Ok(Some(bytes))
    }

    fn close_all(self) -> AcqResult<()> {
        for group in [self.all, self.first, self.last] {
            if let Some(w) = group.writer {
                w.close()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_matches_stacked_save_policy_scenario() {
        // acq_total=250, save_first=75, save_last=80, non-overlapping.
        let total = Some(250);
        assert_eq!(classify(0, total, 75, 80, false), SaveBucket::First);
        assert_eq!(classify(74, total, 75, 80, false), SaveBucket::First);
        assert_eq!(classify(75, total, 75, 80, false), SaveBucket::Drop);
        assert_eq!(classify(169, total, 75, 80, false), SaveBucket::Drop);
        assert_eq!(classify(170, total, 75, 80, false), SaveBucket::Last);
        assert_eq!(classify(249, total, 75, 80, false), SaveBucket::Last);
    }

    #[test]
    fn classify_both_zero_saves_everything() {
        assert_eq!(classify(0, Some(10), 0, 0, false), SaveBucket::All);
        assert_eq!(classify(9, Some(10), 0, 0, false), SaveBucket::All);
    }

    #[test]
    fn classify_unnormalized_overlap_saves_all() {
        // save_first(6) >= total(10) - save_last(5) == 5: overlap triggers save-all
        // even though 6 + 5 > 10 was never separately checked.
        assert_eq!(classify(7, Some(10), 6, 5, false), SaveBucket::All);
    }

    #[test]
    fn classify_live_mode_ignores_save_last() {
        assert_eq!(classify(100, None, 5, 3, true), SaveBucket::Drop);
        assert_eq!(classify(2, None, 5, 3, true), SaveBucket::First);
    }

    #[test]
    fn compute_q2_max_floors_at_128() {
        let mem = MemoryTotals {
            phys_total: 1024,
            virt_total: 1024,
        };
        assert_eq!(compute_q2_max(mem, 16), 128);
    }

    #[test]
    fn compute_q2_max_scales_with_memory() {
        let mem = MemoryTotals {
            phys_total: 8 * 1024 * 1024 * 1024,
            virt_total: 128u64 * 1024 * 1024 * 1024 * 1024,
        };
        let q2_max = compute_q2_max(mem, 1024);
        assert!(q2_max > 128);
    }
}
