//! Free-frame pool: a bounded reservoir of pre-allocated [`Frame`] buffers.
//!
//! Producers (the EOF callback) draw from the pool; consumers (the disk
//! worker) return to it once a frame has been written and invalidated.
//! Translated from the teacher's generic `Pool<T>` (semaphore + free-list
//! + slot cache, built for async callers) into a plain
//! `parking_lot::Mutex`-guarded free-list: nothing in this pool's call
//! sites ever awaits, since the EOF callback and the disk worker are both
//! plain `std::thread`s.

use parking_lot::Mutex;

use crate::frame::{AcqCfg, Frame};

/// Bounded reservoir of pre-allocated, AcqCfg-compatible [`Frame`]s.
pub struct FramePool {
    inner: Mutex<Inner>,
}

struct Inner {
    cfg: AcqCfg,
    deep_copy: bool,
    free: Vec<Frame>,
    target: usize,
    acquisition_over: bool,
}

impl FramePool {
    /// Builds a pool for `cfg`/`deep_copy`, pre-allocating `target` frames.
    #[must_use]
    pub fn new(cfg: AcqCfg, deep_copy: bool, target: usize) -> Self {
        let free = (0..target).map(|_| Frame::new(cfg, deep_copy)).collect();
        Self {
            inner: Mutex::new(Inner {
                cfg,
                deep_copy,
                free,
                target,
                acquisition_over: false,
            }),
        }
    }

    /// Pops one frame; if empty, allocates a fresh one with the current
    /// `AcqCfg`. Only fails if allocation itself fails, which cannot
    /// happen under `Vec`'s panic-on-OOM allocator -- kept `Result`-typed
    /// per the spec's contract in case a future backing store can fail.
    pub fn draw(&self) -> Frame {
        let mut inner = self.inner.lock();
        inner
            .free
            .pop()
            .unwrap_or_else(|| Frame::new(inner.cfg, inner.deep_copy))
    }

    /// Returns a frame to the pool without validation. If the acquisition
    /// is known to be over the frame is dropped instead, so a storm of
    /// late returns during teardown cannot grow the pool unbounded.
    pub fn give_back(&self, frame: Frame) {
        let mut inner = self.inner.lock();
        if inner.acquisition_over {
            drop(frame);
            return;
        }
        inner.free.push(frame);
    }

    /// Marks the pool as draining: further `give_back` calls drop their
    /// argument instead of growing the free list.
    pub fn mark_acquisition_over(&self) {
        self.inner.lock().acquisition_over = true;
    }

    /// Drains frames whose `AcqCfg`/`deep_copy` mismatch, trims to
    /// `target_n`, and tops up to `target_n` with fresh frames of the
    /// current configuration.
    pub fn preallocate(&self, cfg: AcqCfg, deep_copy: bool, target_n: usize) {
        let mut inner = self.inner.lock();
        inner.cfg = cfg;
        inner.deep_copy = deep_copy;
        inner.acquisition_over = false;
        inner
            .free
            .retain(|f| f.cfg() == cfg && f.deep_copy() == deep_copy);
        inner.free.truncate(target_n);
        while inner.free.len() < target_n {
            inner.free.push(Frame::new(cfg, deep_copy));
        }
        inner.target = target_n;
    }

    /// Number of frames currently sitting idle in the pool.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// The pool's configured target size.
    #[must_use]
    pub fn target(&self) -> usize {
        self.inner.lock().target
    }
}

/// Initial free-pool size, per §3: `min(10 + min(acq_count, 100 MiB /
/// frame_bytes), q2_max)`. `acq_count = 0` is treated as "unbounded"
/// (Live* modes), matching the 100 MiB cap alone.
#[must_use]
pub fn initial_pool_size(acq_count: u32, frame_bytes: u32, q2_max: usize) -> usize {
    const HUNDRED_MIB: u64 = 100 * 1024 * 1024;
    let frame_bytes = frame_bytes.max(1) as u64;
    let by_memory = HUNDRED_MIB / frame_bytes;
    let acq_bound = if acq_count == 0 {
        by_memory
    } else {
        by_memory.min(u64::from(acq_count))
    };
    let size = 10u64 + acq_bound;
    (size as usize).min(q2_max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AcqCfg {
        AcqCfg {
            frame_bytes: 16,
            roi_count: 0,
            has_metadata: false,
        }
    }

    #[test]
    fn draw_reuses_and_allocates_on_empty() {
        let pool = FramePool::new(cfg(), true, 2);
        assert_eq!(pool.idle_count(), 2);
        let a = pool.draw();
        let b = pool.draw();
        let c = pool.draw(); // pool was empty, allocates fresh
        assert_eq!(pool.idle_count(), 0);
        pool.give_back(a);
        pool.give_back(b);
        pool.give_back(c);
        assert_eq!(pool.idle_count(), 3);
    }

    #[test]
    fn give_back_after_acquisition_over_drops() {
        let pool = FramePool::new(cfg(), true, 1);
        let f = pool.draw();
        pool.mark_acquisition_over();
        pool.give_back(f);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn preallocate_drains_mismatched_frames() {
        let pool = FramePool::new(cfg(), true, 4);
        let new_cfg = AcqCfg {
            frame_bytes: 32,
            roi_count: 0,
            has_metadata: false,
        };
        pool.preallocate(new_cfg, true, 2);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.target(), 2);
    }

    #[test]
    fn initial_pool_size_matches_formula() {
        assert_eq!(initial_pool_size(5, 1024, 1000), 15);
        assert_eq!(initial_pool_size(0, 1024 * 1024, 1000), 110); // capped by memory then min() with q2_max not hit
        assert_eq!(initial_pool_size(5000, 1024 * 1024, 50), 50); // capped by q2_max
    }
}
