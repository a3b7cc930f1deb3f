//! FPS limiter: couples a fast producer to a slow consumer via a
//! logical AND of two independent boolean-latch inputs, "timer tick" and
//! "new frame arrived".
//!
//! Translated from `FpsLimiter.{h,cpp}`. The original splits its state
//! across two mutexes (one for `m_timerEventOn`/`m_frameEventOn`/`m_frame`,
//! one guarding only the wake flag); this version folds both into one
//! `parking_lot::Mutex`-guarded state struct plus one condvar, since
//! nothing here holds the lock across a blocking call -- the split only
//! existed to let `InputTimerTick`/`InputNewFrame` avoid contending with
//! the worker thread's own lock acquisition, which a single short
//! critical section already avoids.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

struct State<F> {
    timer_on: bool,
    frame_on: bool,
    frame: Option<F>,
    event: bool,
    abort: bool,
}

impl<F> Default for State<F> {
    fn default() -> Self {
        Self {
            timer_on: false,
            frame_on: false,
            frame: None,
            event: false,
            abort: false,
        }
    }
}

/// Fires its callback at most once per matched (tick, frame) pair. `F`
/// is whatever the caller wants delivered -- typically a cheap tee of
/// the latest frame. Held behind an `Arc` so the worker thread can share
/// ownership without borrowing from a shorter-lived caller.
pub struct FpsLimiter<F: Send + 'static> {
    state: Mutex<State<F>>,
    cond: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<F: Send + 'static> FpsLimiter<F> {
    /// A limiter with no thread running yet.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
            handle: Mutex::new(None),
        })
    }

    /// Starts the worker thread. A no-op if already running. The first
    /// tick (before any frame arrives) is latched immediately so the
    /// very first frame is delivered without waiting for a second tick.
    pub fn start<Cb>(self: &Arc<Self>, mut callback: Cb)
    where
        Cb: FnMut(Option<F>) + Send + 'static,
    {
        let mut handle_guard = self.handle.lock();
        if handle_guard.is_some() {
            return;
        }

        {
            let mut state = self.state.lock();
            *state = State::default();
            state.timer_on = true;
        }

        let this = Arc::clone(self);
        let thread = std::thread::Builder::new()
            .name("fps-limiter".to_string())
            .spawn(move || loop {
                let frame = {
                    let mut state = this.state.lock();
                    if !state.event {
                        this.cond.wait_while(&mut state, |s| !s.abort && !s.event);
                    }
                    if state.abort && !state.event {
                        break;
                    }
                    state.event = false;
                    state.timer_on = false;
                    state.frame_on = false;
                    state.frame.take()
                };
                callback(frame);
            })
            .expect("spawning the fps-limiter thread should not fail");

        *handle_guard = Some(thread);
    }

    /// Whether the worker thread is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Stops the limiter. If `process_waiting_frame` and a frame is
    /// already latched, it is delivered one last time before the thread
    /// exits; otherwise any latched-but-undelivered frame is dropped.
    pub fn stop(&self, process_waiting_frame: bool) {
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return;
        };

        {
            let mut state = self.state.lock();
            state.event = process_waiting_frame && state.frame_on;
            state.abort = true;
        }
        self.cond.notify_one();

        let _ = handle.join();

        let mut state = self.state.lock();
        *state = State::default();
    }

    /// Latches "timer tick on". If a frame is already latched, fires the
    /// matched event immediately.
    pub fn input_timer_tick(&self) {
        let frame_on = {
            let mut state = self.state.lock();
            state.timer_on = true;
            state.frame_on
        };
        if frame_on {
            self.signal_event();
        }
    }

    /// Stores `frame` and latches "frame on". If a timer tick is already
    /// latched, fires the matched event immediately.
    pub fn input_new_frame(&self, frame: F) {
        let timer_on = {
            let mut state = self.state.lock();
            state.frame = Some(frame);
            state.frame_on = true;
            state.timer_on
        };
        if timer_on {
            self.signal_event();
        }
    }

    fn signal_event(&self) {
        let mut state = self.state.lock();
        if state.event {
            return;
        }
        state.event = true;
        drop(state);
        self.cond.notify_one();
    }
}

impl<F: Send + 'static> Drop for FpsLimiter<F> {
    fn drop(&mut self) {
        self.stop(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn first_tick_is_latched_so_first_frame_fires_immediately() {
        let limiter = FpsLimiter::new();
        let (tx, rx) = mpsc::channel();
        limiter.start(move |frame: Option<i32>| {
            let _ = tx.send(frame);
        });
        limiter.input_new_frame(1);
        let got = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got, Some(1));
        limiter.stop(false);
    }

    #[test]
    fn intermediate_frames_between_ticks_are_dropped() {
        let limiter = FpsLimiter::new();
        let (tx, rx) = mpsc::channel();
        limiter.start(move |frame: Option<i32>| {
            let _ = tx.send(frame);
        });
        // first frame fires against the latched initial tick
        limiter.input_new_frame(1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some(1));

        // no tick yet: these overwrite each other, only the last survives
        limiter.input_new_frame(2);
        limiter.input_new_frame(3);
        assert!(rx.try_recv().is_err());

        limiter.input_timer_tick();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some(3));
        limiter.stop(false);
    }

    #[test]
    fn stop_without_processing_drops_the_waiting_frame() {
        let limiter = FpsLimiter::new();
        let (tx, rx) = mpsc::channel();
        limiter.start(move |frame: Option<i32>| {
            let _ = tx.send(frame);
        });
        limiter.input_new_frame(1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some(1));

        // frame_on latched, no matching tick yet
        limiter.input_new_frame(2);
        limiter.stop(false);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stop_processing_last_frame_delivers_it_once() {
        let limiter = FpsLimiter::new();
        let (tx, rx) = mpsc::channel();
        limiter.start(move |frame: Option<i32>| {
            let _ = tx.send(frame);
        });
        limiter.input_new_frame(1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some(1));

        limiter.input_new_frame(2);
        limiter.stop(true);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some(2));
    }
}
