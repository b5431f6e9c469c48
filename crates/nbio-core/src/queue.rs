//! FIFO work queue with spin-then-block pop
//!
//! One queue per worker. Producers push from any thread; the owning
//! worker pops. `pop` spins a bounded number of iterations (taking and
//! releasing the lock each time) before falling back to a condvar wait,
//! which amortizes the wakeup cost under a high producer rate.
//!
//! Ordering: FIFO between items pushed by the same producer. No global
//! ordering across producers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// Default number of lock-and-try iterations before blocking.
pub const DEFAULT_SPIN_ITERS: u32 = 100;

/// Blocking multi-producer FIFO queue.
pub struct WorkQueue<T> {
    queue: Mutex<VecDeque<T>>,
    cond: Condvar,
    /// Mirror of the queue length, updated under the lock. Lets
    /// `is_empty`/`len` take a momentary snapshot without contending.
    len: AtomicUsize,
    spin_iters: u32,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self::with_spin(DEFAULT_SPIN_ITERS)
    }

    /// Create a queue with an explicit spin budget (0 = block straight
    /// away).
    pub fn with_spin(spin_iters: u32) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            len: AtomicUsize::new(0),
            spin_iters,
        }
    }

    /// Enqueue one item and signal one waiter.
    pub fn push(&self, item: T) {
        {
            let mut q = self.queue.lock().unwrap();
            q.push_back(item);
            self.len.store(q.len(), Ordering::Release);
        }
        // Signal outside the lock so the waiter doesn't wake into a
        // held mutex.
        self.cond.notify_one();
    }

    /// Non-blocking dequeue.
    pub fn try_pop(&self) -> Option<T> {
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut q = self.queue.lock().unwrap();
        let item = q.pop_front();
        self.len.store(q.len(), Ordering::Release);
        item
    }

    /// Dequeue the oldest item, blocking until one is available.
    ///
    /// Spins `spin_iters` lock-and-try attempts first, then waits on
    /// the condvar.
    pub fn pop(&self) -> T {
        for _ in 0..self.spin_iters {
            if let Some(item) = self.try_pop() {
                return item;
            }
        }

        let mut q = self.queue.lock().unwrap();
        loop {
            if let Some(item) = q.pop_front() {
                self.len.store(q.len(), Ordering::Release);
                return item;
            }
            q = self.cond.wait(q).unwrap();
        }
    }

    /// Momentary length snapshot. Safe to call concurrently.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Momentary emptiness snapshot.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
