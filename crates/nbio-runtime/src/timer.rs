//! Timer service
//!
//! Delayed dispatch driven by one `timerfd` on CLOCK_MONOTONIC. A
//! dedicated thread blocks in `read(2)` on the fd; each expiration pops
//! every due event from a deadline-ordered set and posts it to the pool.
//!
//! Equal deadlines fire in insertion order (the key carries an insertion
//! sequence as tiebreaker). Wall-clock adjustments never reorder events.
//!
//! The fd is armed with `TFD_TIMER_ABSTIME` and only while the event-set
//! mutex is held: whoever changes the earliest deadline rearms.

use crate::pool::ThreadPool;
use nbio_core::{nb_debug, Routine};
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Deadline-then-insertion ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline_ns: u64,
    seq: u64,
}

struct TimerState {
    events: BTreeMap<TimerKey, Routine>,
    next_seq: u64,
}

struct TimerShared {
    fd: RawFd,
    pool: ThreadPool,
    state: Mutex<TimerState>,
    stop: AtomicBool,
}

/// Monotonic-clock timer service.
pub struct TimerService {
    shared: Arc<TimerShared>,
    thread: Option<JoinHandle<()>>,
}

impl TimerService {
    /// Create the timerfd and start the expiration thread. Expired
    /// routines are dispatched through `pool`.
    pub fn start(pool: ThreadPool) -> Self {
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC) };
        assert!(fd >= 0, "timerfd_create failed: errno {}", errno());

        let shared = Arc::new(TimerShared {
            fd,
            pool,
            state: Mutex::new(TimerState {
                events: BTreeMap::new(),
                next_seq: 0,
            }),
            stop: AtomicBool::new(false),
        });

        let shared_clone = shared.clone();
        let thread = thread::Builder::new()
            .name("nbio-timer".into())
            .spawn(move || timer_loop(shared_clone))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Schedule `r` to be dispatched to the pool after `ms` milliseconds.
    pub fn schedule_in(&self, ms: u64, r: Routine) {
        assert!(
            !self.shared.stop.load(Ordering::Acquire),
            "schedule_in on a timer service that was shut down"
        );

        let deadline_ns = monotonic_now_ns() + ms * 1_000_000;

        let mut st = self.shared.state.lock().unwrap();
        let key = TimerKey {
            deadline_ns,
            seq: st.next_seq,
        };
        st.next_seq += 1;

        let is_earliest = st.events.keys().next().map_or(true, |first| key < *first);
        st.events.insert(key, r);

        if is_earliest {
            arm_absolute(self.shared.fd, deadline_ns);
        }
    }

    /// Pending event count (momentary snapshot).
    pub fn pending(&self) -> usize {
        self.shared.state.lock().unwrap().events.len()
    }

    /// Stop the expiration thread and close the fd.
    ///
    /// Precondition: the event set is empty. Users drain or never
    /// schedule timers that outlive teardown.
    pub fn shutdown(&mut self) {
        {
            let st = self.shared.state.lock().unwrap();
            assert!(
                st.events.is_empty(),
                "timer service shut down with {} events pending",
                st.events.len()
            );
        }

        self.shared.stop.store(true, Ordering::Release);
        // Unblock the reader with an immediate expiration.
        arm_relative_ns(self.shared.fd, 1);

        if let Some(handle) = self.thread.take() {
            handle.join().expect("timer thread panicked");
        }

        unsafe { libc::close(self.shared.fd) };
        nb_debug!("timer service shut down");
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

fn timer_loop(shared: Arc<TimerShared>) {
    loop {
        let mut expirations = [0u8; 8];
        let n = unsafe {
            libc::read(
                shared.fd,
                expirations.as_mut_ptr() as *mut libc::c_void,
                expirations.len(),
            )
        };
        if n < 0 {
            if errno() == libc::EINTR {
                continue;
            }
            panic!("timerfd read failed: errno {}", errno());
        }

        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        let fired = {
            let mut st = shared.state.lock().unwrap();
            let now = monotonic_now_ns();
            let mut fired = Vec::new();

            loop {
                match st.events.first_key_value() {
                    Some((key, _)) if key.deadline_ns <= now => {
                        let (_, r) = st.events.pop_first().unwrap();
                        fired.push(r);
                    }
                    _ => break,
                }
            }

            if let Some((key, _)) = st.events.first_key_value() {
                arm_absolute(shared.fd, key.deadline_ns);
            }

            fired
        };

        for r in fired {
            shared.pool.schedule_routine(r);
        }
    }
}

fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    assert_eq!(rc, 0, "clock_gettime failed: errno {}", errno());
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn arm_absolute(fd: RawFd, deadline_ns: u64) {
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: (deadline_ns / 1_000_000_000) as libc::time_t,
            tv_nsec: (deadline_ns % 1_000_000_000) as libc::c_long,
        },
    };
    let rc =
        unsafe { libc::timerfd_settime(fd, libc::TFD_TIMER_ABSTIME, &spec, std::ptr::null_mut()) };
    assert_eq!(rc, 0, "timerfd_settime failed: errno {}", errno());
}

fn arm_relative_ns(fd: RawFd, ns: u64) {
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: (ns / 1_000_000_000) as libc::time_t,
            tv_nsec: (ns % 1_000_000_000) as libc::c_long,
        },
    };
    let rc = unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) };
    assert_eq!(rc, 0, "timerfd_settime failed: errno {}", errno());
}

#[inline]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn small_pool() -> ThreadPool {
        let pool = ThreadPool::new();
        pool.start(crate::RuntimeConfig::new().num_workers(1));
        pool
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let pool = small_pool();
        let (tx, rx) = mpsc::channel();

        // Scheduled out of order: {+300ms, +100ms, +200ms}.
        for (delay, tag) in [(300u64, 300u32), (100, 100), (200, 200)] {
            let tx = tx.clone();
            pool.schedule_in(delay, move || {
                tx.send(tag).unwrap();
            });
        }

        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), 100);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), 200);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), 300);

        pool.shutdown();
    }

    #[test]
    fn test_equal_deadlines_fifo() {
        let pool = small_pool();
        let (tx, rx) = mpsc::channel();

        for i in 0..5u32 {
            let tx = tx.clone();
            pool.schedule_in(50, move || {
                tx.send(i).unwrap();
            });
        }

        let timeout = Duration::from_secs(5);
        for i in 0..5u32 {
            assert_eq!(rx.recv_timeout(timeout).unwrap(), i);
        }

        pool.shutdown();
    }

    #[test]
    fn test_earlier_insert_rearms() {
        let pool = small_pool();
        let (tx, rx) = mpsc::channel();

        // A long timer first, then a short one: the short one must not
        // wait behind the long one's deadline.
        let tx1 = tx.clone();
        pool.schedule_in(2_000, move || {
            tx1.send("long").unwrap();
        });
        let tx2 = tx.clone();
        pool.schedule_in(50, move || {
            tx2.send("short").unwrap();
        });

        assert_eq!(
            rx.recv_timeout(Duration::from_millis(1_000)).unwrap(),
            "short"
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "long");

        pool.shutdown();
    }
}
