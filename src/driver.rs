//! The driver collaborator contract plus a deterministic fake camera.
//!
//! `CameraDriver` is deliberately small and synchronous: no `async_trait`,
//! no tokio task context. The engine calls it from plain `std::thread`s,
//! and the EOF callback it registers through `start_exp` is itself a
//! plain closure invoked from whatever thread the driver runs its own
//! polling/interrupt-simulation loop on. Grounded on `daq-core::driver`
//! for the "trait expresses exactly the external contract" shape, and on
//! `daq-driver-mock::mock_camera` for the fake-device idea (configurable
//! rate, frame loss simulation, background generation thread) -- ported
//! from tokio tasks and broadcast channels to a single `std::thread` and
//! plain callback, since nothing in this engine's own call sites awaits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{AcqError, AcqResult};
use crate::frame::{AcqCfg, Frame, FrameInfo};
use crate::settings::Settings;

/// Device acquisition state, as reported by `acq_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqStatus {
    /// No acquisition is running.
    Inactive,
    /// An acquisition is in progress.
    Active,
    /// The device reported a failure; the engine must abort.
    Failure,
}

/// The EOF callback's payload: the frame info for a completed exposure,
/// or `None` to signal a device failure (the null-frame_info case).
pub type EofCallback = Box<dyn FnMut(Option<FrameInfo>) + Send>;

/// Everything the engine needs from a camera. One implementation talks
/// to real hardware; [`FakeCamera`] fabricates frames deterministically
/// for tests and the CLI's `--driver fake` mode.
pub trait CameraDriver: Send + Sync {
    /// One-time driver library initialization.
    fn init(&mut self) -> AcqResult<()>;
    /// Releases driver library resources.
    fn uninit(&mut self) -> AcqResult<()>;
    /// Number of cameras the driver can see.
    fn count(&self) -> u32;
    /// Human-readable name of camera `index`.
    fn name_at(&self, index: u32) -> AcqResult<String>;
    /// Opens the named camera for exclusive use.
    fn open(&mut self, name: &str) -> AcqResult<()>;
    /// Closes the currently open camera.
    fn close(&mut self) -> AcqResult<()>;
    /// Configures the device ring for `settings.buffer_frame_count()`
    /// frames and returns the resulting per-frame byte size. Rejects
    /// `frame_bytes == 0` as `ConfigInvalid`.
    fn setup_exp(&mut self, settings: &Settings) -> AcqResult<u32>;
    /// Registers `callback` to be invoked once per completed exposure
    /// from a driver-owned thread, and starts the acquisition.
    fn start_exp(&mut self, callback: EofCallback) -> AcqResult<()>;
    /// Stops the acquisition; idempotent.
    fn stop_exp(&mut self) -> AcqResult<()>;
    /// Current device state.
    fn acq_status(&self) -> AcqStatus;
    /// Fills `frame`'s borrowed pointer and info with the most recently
    /// completed exposure. Fails if no frame has completed yet.
    fn get_latest_frame(&self, frame: &mut Frame) -> AcqResult<()>;
    /// The `AcqCfg` negotiated by the last `setup_exp` call.
    fn get_frame_acq_cfg(&self) -> AcqCfg;
    /// Device ring depth; always `>= 3` so `Q1_max >= 1`.
    fn get_max_buffered_frames(&self) -> u32;
    /// A snapshot of the settings this driver was configured with.
    fn settings(&self) -> Arc<Settings>;
}

/// Configuration for [`FakeCamera`]'s frame generation.
#[derive(Debug, Clone)]
pub struct FakeCameraConfig {
    /// Output frame width in pixels.
    pub width: u16,
    /// Output frame height in pixels.
    pub height: u16,
    /// Frame numbers to emit in order, including any repeats (to exercise
    /// out-of-order/duplicate handling) or intentional gaps. When `None`,
    /// `1..=frame_count` is emitted.
    pub frame_sequence: Option<Vec<u32>>,
    /// Used when `frame_sequence` is `None`.
    pub frame_count: u32,
    /// Delay between emitted frames. Zero for "as fast as possible".
    pub interval: Duration,
    /// Device ring depth.
    pub buffer_frame_count: u32,
}

impl Default for FakeCameraConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 64,
            frame_sequence: None,
            frame_count: 100,
            interval: Duration::from_millis(0),
            buffer_frame_count: 16,
        }
    }
}

struct RingSlot {
    info: FrameInfo,
}

/// A fully deterministic, in-process stand-in for a real camera. Used by
/// every test in this repository and by the CLI's `--driver fake` mode.
pub struct FakeCamera {
    cfg: FakeCameraConfig,
    frame_bytes: u32,
    ring: Mutex<Vec<Box<[u8]>>>,
    latest: Mutex<Option<(usize, FrameInfo)>>,
    status: Mutex<AcqStatus>,
    thread: Mutex<Option<JoinHandle<()>>>,
    abort: Arc<AtomicBool>,
    settings: Mutex<Arc<Settings>>,
    open: Mutex<bool>,
}

impl FakeCamera {
    /// Builds a fake camera from `cfg`, not yet opened or configured.
    #[must_use]
    pub fn new(cfg: FakeCameraConfig) -> Self {
        Self {
            cfg,
            frame_bytes: 0,
            ring: Mutex::new(Vec::new()),
            latest: Mutex::new(None),
            status: Mutex::new(AcqStatus::Inactive),
            thread: Mutex::new(None),
            abort: Arc::new(AtomicBool::new(false)),
            settings: Mutex::new(Settings::new().setup()),
            open: Mutex::new(false),
        }
    }

    fn sequence(&self) -> Vec<u32> {
        self.cfg
            .frame_sequence
            .clone()
            .unwrap_or_else(|| (1..=self.cfg.frame_count).collect())
    }
}

impl CameraDriver for FakeCamera {
    fn init(&mut self) -> AcqResult<()> {
        Ok(())
    }

    fn uninit(&mut self) -> AcqResult<()> {
        Ok(())
    }

    fn count(&self) -> u32 {
        1
    }

    fn name_at(&self, index: u32) -> AcqResult<String> {
        if index == 0 {
            Ok("FakeCamera-0".to_string())
        } else {
            Err(AcqError::ConfigInvalid(format!(
                "no camera at index {index}"
            )))
        }
    }

    fn open(&mut self, _name: &str) -> AcqResult<()> {
        *self.open.lock() = true;
        Ok(())
    }

    fn close(&mut self) -> AcqResult<()> {
        *self.open.lock() = false;
        Ok(())
    }

    fn setup_exp(&mut self, settings: &Settings) -> AcqResult<u32> {
        let frame_bytes = u32::from(self.cfg.width) * u32::from(self.cfg.height) * 2;
        if frame_bytes == 0 {
            return Err(AcqError::ConfigInvalid(
                "frame_bytes must not be 0".to_string(),
            ));
        }
        let slots = (0..self.cfg.buffer_frame_count)
            .map(|_| vec![0u8; frame_bytes as usize].into_boxed_slice())
            .collect();
        *self.ring.lock() = slots;
        self.frame_bytes = frame_bytes;
        *self.settings.lock() = Arc::new(settings.clone());
        Ok(frame_bytes)
    }

    fn start_exp(&mut self, mut callback: EofCallback) -> AcqResult<()> {
        self.abort.store(false, Ordering::Relaxed);
        *self.status.lock() = AcqStatus::Active;

        let sequence = self.sequence();
        let interval = self.cfg.interval;
        let frame_bytes = self.frame_bytes as usize;
        let buffer_frame_count = self.cfg.buffer_frame_count as usize;
        let ring = {
            // Share the same backing storage the ring field points at by
            // cloning the Arc-free Mutex contents is not possible; instead
            // the generation thread locks `self.ring` through a raw
            // pointer scoped to this driver's own lifetime, mirroring how
            // a real device's ring outlives the acquisition it serves.
            std::ptr::addr_of!(self.ring)
        };
        let latest = std::ptr::addr_of!(self.latest);
        let status = std::ptr::addr_of!(self.status);
        let abort = Arc::clone(&self.abort);

        // SAFETY: `FakeCamera` never moves its `ring`/`latest`/`status`
        // fields (they are plain `Mutex`es, not relocated by any method),
        // and `stop_exp` always joins this thread before `self` can be
        // dropped, so these pointers remain valid for the thread's
        // entire run.
        let ring_ref: &'static Mutex<Vec<Box<[u8]>>> = unsafe { &*ring };
        let latest_ref: &'static Mutex<Option<(usize, FrameInfo)>> = unsafe { &*latest };
        let status_ref: &'static Mutex<AcqStatus> = unsafe { &*status };

        let handle = std::thread::Builder::new()
            .name("fake-camera".to_string())
            .spawn(move || {
                let start = std::time::Instant::now();
                for (i, frame_nr) in sequence.into_iter().enumerate() {
                    if abort.load(Ordering::Relaxed) {
                        break;
                    }
                    if !interval.is_zero() {
                        std::thread::sleep(interval);
                    }

                    let slot = i % buffer_frame_count.max(1);
                    let timestamp_bof = start.elapsed().as_micros() as u64;
                    {
                        let mut ring = ring_ref.lock();
                        let fill = (frame_nr & 0xff) as u8;
                        ring[slot].fill(fill);
                        let _ = frame_bytes; // length is fixed at setup_exp time
                    }
                    let timestamp_eof = start.elapsed().as_micros() as u64;
                    let info = FrameInfo {
                        frame_nr,
                        timestamp_bof,
                        timestamp_eof,
                    };
                    *latest_ref.lock() = Some((slot, info));
                    callback(Some(info));
                }
                *status_ref.lock() = AcqStatus::Inactive;
            })
            .expect("spawning the fake-camera thread should not fail");

        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn stop_exp(&mut self) -> AcqResult<()> {
        self.abort.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        *self.status.lock() = AcqStatus::Inactive;
        Ok(())
    }

    fn acq_status(&self) -> AcqStatus {
        *self.status.lock()
    }

    fn get_latest_frame(&self, frame: &mut Frame) -> AcqResult<()> {
        let ring = self.ring.lock();
        let latest = *self.latest.lock();
        let (slot, info) = latest.ok_or_else(|| {
            AcqError::DeviceFatal("get_latest_frame called before any frame completed".to_string())
        })?;
        let data = &ring[slot];
        let ptr = data.as_ptr();
        let len = data.len();
        // SAFETY: `data` is heap storage owned by `self.ring` for this
        // camera's entire lifetime; slots are only ever overwritten in
        // place, never reallocated, so the pointer stays valid until the
        // generation thread reuses this slot -- matching the real
        // device ring's `frame_nr + Q1_max <= latest_received` expiry.
        unsafe {
            frame.set_data_pointer(ptr, len, info);
        }
        Ok(())
    }

    fn get_frame_acq_cfg(&self) -> AcqCfg {
        AcqCfg {
            frame_bytes: self.frame_bytes,
            roi_count: 0,
            has_metadata: false,
        }
    }

    fn get_max_buffered_frames(&self) -> u32 {
        self.cfg.buffer_frame_count
    }

    fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn happy_path_emits_monotonic_frame_numbers() {
        let mut camera = FakeCamera::new(FakeCameraConfig {
            frame_count: 10,
            ..Default::default()
        });
        camera.setup_exp(&Settings::new()).unwrap();

        let (tx, rx) = mpsc::channel();
        camera
            .start_exp(Box::new(move |info| {
                let _ = tx.send(info);
            }))
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap().frame_nr);
        }
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());
        camera.stop_exp().unwrap();
    }

    #[test]
    fn scripted_sequence_reproduces_gap_scenario() {
        let mut camera = FakeCamera::new(FakeCameraConfig {
            frame_sequence: Some(vec![1, 2, 4, 5, 8]),
            ..Default::default()
        });
        camera.setup_exp(&Settings::new()).unwrap();

        let (tx, rx) = mpsc::channel();
        camera
            .start_exp(Box::new(move |info| {
                let _ = tx.send(info);
            }))
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap().frame_nr);
        }
        assert_eq!(seen, vec![1, 2, 4, 5, 8]);
        camera.stop_exp().unwrap();
    }

    #[test]
    fn get_latest_frame_reflects_most_recent_slot() {
        let mut camera = FakeCamera::new(FakeCameraConfig {
            width: 2,
            height: 2,
            frame_count: 3,
            ..Default::default()
        });
        camera.setup_exp(&Settings::new()).unwrap();
        let cfg = camera.get_frame_acq_cfg();

        let (tx, rx) = mpsc::channel();
        camera
            .start_exp(Box::new(move |info| {
                let _ = tx.send(info);
            }))
            .unwrap();
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(1)).unwrap();
        }
        camera.stop_exp().unwrap();

        let mut frame = Frame::new(cfg, true);
        camera.get_latest_frame(&mut frame).unwrap();
        frame.copy_data().unwrap();
        assert_eq!(frame.info().unwrap().frame_nr, 3);
    }

    #[test]
    fn setup_rejects_zero_sized_frames() {
        let mut camera = FakeCamera::new(FakeCameraConfig {
            width: 0,
            height: 0,
            ..Default::default()
        });
        assert!(camera.setup_exp(&Settings::new()).is_err());
    }
}
