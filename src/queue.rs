//! A single bounded-queue type shared by Q1 and Q2, parameterized by
//! capacity and drop policy, per the redesign note that centralizes the
//! ad hoc mutex+condvar queues scattered through the original.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// What happens when a bounded queue is full and a new item arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Evict the oldest queued item, then push the new one. Used for Q1:
    /// the evicted entry's device-ring data is about to be overwritten
    /// anyway, so keeping it serves no purpose.
    Oldest,
    /// Reject the new item outright, leaving the queue unchanged. Used
    /// for Q2: a frame that never makes it onto the save queue is simply
    /// lost, not swapped for a different one.
    Newest,
}

/// A bounded, mutex+condvar-guarded FIFO with peak/lost tracking and a
/// configurable overflow policy.
pub struct BoundedQueue<T> {
    capacity: AtomicUsize,
    policy: DropPolicy,
    state: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    peak: AtomicUsize,
    lost: AtomicU64,
    abort: std::sync::atomic::AtomicBool,
}

impl<T> BoundedQueue<T> {
    /// Builds a queue with the given capacity (clamped to at least 1) and
    /// overflow policy.
    #[must_use]
    pub fn new(capacity: usize, policy: DropPolicy) -> Self {
        Self {
            capacity: AtomicUsize::new(capacity.max(1)),
            policy,
            state: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            peak: AtomicUsize::new(0),
            lost: AtomicU64::new(0),
            abort: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Resizes capacity, e.g. the reporter's free-RAM-driven Q2 resize.
    /// Never drops below the current occupancy, so a shrink can never
    /// discard already-queued items.
    pub fn set_capacity(&self, new_capacity: usize) {
        let floor = self.len();
        self.capacity
            .store(new_capacity.max(1).max(floor), Ordering::Relaxed);
    }

    /// Non-blocking push. On overflow, applies the configured drop
    /// policy and counts one loss; always returns the item's fate so
    /// callers can track more specific statistics (e.g. which frame
    /// number was dropped).
    pub fn try_push(&self, item: T) -> PushOutcome<T> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let capacity = self.capacity.load(Ordering::Relaxed);
        let outcome = if guard.len() < capacity {
            guard.push_back(item);
            PushOutcome::Pushed
        } else {
            match self.policy {
                DropPolicy::Oldest => {
                    let evicted = guard.pop_front();
                    guard.push_back(item);
                    self.lost.fetch_add(1, Ordering::Relaxed);
                    PushOutcome::DroppedOldest(evicted)
                }
                DropPolicy::Newest => {
                    self.lost.fetch_add(1, Ordering::Relaxed);
                    PushOutcome::DroppedNewest(item)
                }
            }
        };
        let len = guard.len();
        drop(guard);
        self.bump_peak(len);
        self.not_empty.notify_one();
        outcome
    }

    /// Blocking pop with a timeout; wakes early on push or on `notify_abort`.
    /// Returns `None` on timeout or if the queue is empty after an abort
    /// wakeup.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(item) = guard.pop_front() {
                return Some(item);
            }
            if self.abort.load(Ordering::Relaxed) {
                return None;
            }
            let (next_guard, result) = self
                .not_empty
                .wait_timeout(guard, timeout)
                .unwrap_or_else(|e| e.into_inner());
            guard = next_guard;
            if result.timed_out() && guard.is_empty() {
                return None;
            }
        }
    }

    /// Blocking pop with no timeout; wakes on push or on `notify_abort`.
    pub fn pop_wait(&self) -> Option<T> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(item) = guard.pop_front() {
                return Some(item);
            }
            if self.abort.load(Ordering::Relaxed) {
                return None;
            }
            guard = self
                .not_empty
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Latches the abort flag and wakes every waiter so they can observe
    /// it and exit their wait loop.
    pub fn notify_abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
        self.not_empty.notify_all();
    }

    /// Current occupancy.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the queue currently holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// This queue's configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Highest occupancy ever observed.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Cumulative count of items dropped due to overflow.
    #[must_use]
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    fn bump_peak(&self, len: usize) {
        let mut current = self.peak.load(Ordering::Relaxed);
        while len > current {
            match self
                .peak
                .compare_exchange_weak(current, len, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

/// The fate of an item passed to `try_push`.
pub enum PushOutcome<T> {
    /// The item was queued.
    Pushed,
    /// The queue was full; the oldest item was evicted (returned here)
    /// and the new item was queued in its place.
    DroppedOldest(Option<T>),
    /// The queue was full; the new item itself was rejected and is
    /// handed back to the caller.
    DroppedNewest(T),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_oldest_evicts_front_on_overflow() {
        let q: BoundedQueue<i32> = BoundedQueue::new(2, DropPolicy::Oldest);
        assert!(matches!(q.try_push(1), PushOutcome::Pushed));
        assert!(matches!(q.try_push(2), PushOutcome::Pushed));
        match q.try_push(3) {
            PushOutcome::DroppedOldest(Some(1)) => {}
            _ => panic!("expected oldest (1) to be evicted"),
        }
        assert_eq!(q.len(), 2);
        assert_eq!(q.lost(), 1);
        assert_eq!(q.pop_wait(), Some(2));
        assert_eq!(q.pop_wait(), Some(3));
    }

    #[test]
    fn drop_newest_rejects_new_item_on_overflow() {
        let q: BoundedQueue<i32> = BoundedQueue::new(1, DropPolicy::Newest);
        assert!(matches!(q.try_push(1), PushOutcome::Pushed));
        match q.try_push(2) {
            PushOutcome::DroppedNewest(2) => {}
            _ => panic!("expected the new item (2) to be rejected"),
        }
        assert_eq!(q.lost(), 1);
        assert_eq!(q.pop_wait(), Some(1));
    }

    #[test]
    fn peak_tracks_high_water_mark_even_after_draining() {
        let q: BoundedQueue<i32> = BoundedQueue::new(4, DropPolicy::Oldest);
        q.try_push(1);
        q.try_push(2);
        q.try_push(3);
        assert_eq!(q.peak(), 3);
        q.pop_wait();
        q.pop_wait();
        assert_eq!(q.peak(), 3);
        assert!(q.peak() <= q.capacity());
    }

    #[test]
    fn pop_timeout_returns_none_when_empty() {
        let q: BoundedQueue<i32> = BoundedQueue::new(1, DropPolicy::Oldest);
        assert_eq!(
            q.pop_timeout(std::time::Duration::from_millis(10)),
            None
        );
    }

    #[test]
    fn set_capacity_never_shrinks_below_occupancy() {
        let q: BoundedQueue<i32> = BoundedQueue::new(4, DropPolicy::Newest);
        q.try_push(1);
        q.try_push(2);
        q.try_push(3);
        q.set_capacity(1); // below current occupancy of 3
        assert_eq!(q.capacity(), 3);
        q.set_capacity(10);
        assert_eq!(q.capacity(), 10);
    }

    #[test]
    fn notify_abort_wakes_blocked_pop() {
        let q: std::sync::Arc<BoundedQueue<i32>> =
            std::sync::Arc::new(BoundedQueue::new(1, DropPolicy::Oldest));
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.pop_wait());
        std::thread::sleep(std::time::Duration::from_millis(50));
        q.notify_abort();
        assert_eq!(handle.join().unwrap(), None);
    }
}
