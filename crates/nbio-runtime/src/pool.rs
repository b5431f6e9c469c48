//! Thread pool
//!
//! A fixed set of workers fed by round-robin dispatch. The cursor is a
//! plain atomic counter: cross-thread contention only skews the balance
//! by one, which is acceptable for homogeneous I/O work. There is no
//! work stealing and no priority.
//!
//! `schedule_barrier` is the quiescence fence used before resource
//! teardown: it posts a counting arrival to every worker, and the last
//! arrival schedules the fenced routine normally. Because each worker
//! runs its queue in FIFO order, every routine queued anywhere before
//! the barrier call has started before the fenced routine runs.

use crate::config::RuntimeConfig;
use crate::timer::TimerService;
use crate::worker::{current_worker_index, Worker};
use nbio_core::{nb_info, Routine};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};

enum PoolState {
    Idle,
    Running(PoolCore),
    Stopped,
}

struct PoolCore {
    workers: Vec<Worker>,
    timer: TimerService,
}

struct PoolShared {
    state: RwLock<PoolState>,
    cursor: AtomicUsize,
    wait_permits: Mutex<u64>,
    wait_cond: Condvar,
}

/// Handle to the worker pool. Clones share the same pool.
#[derive(Clone)]
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// Create a pool in the idle state. Call `start` before scheduling.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: RwLock::new(PoolState::Idle),
                cursor: AtomicUsize::new(0),
                wait_permits: Mutex::new(0),
                wait_cond: Condvar::new(),
            }),
        }
    }

    /// Process-wide pool instance. A convenience, not a requirement:
    /// every component also accepts an explicit pool.
    pub fn global() -> &'static ThreadPool {
        static GLOBAL: OnceLock<ThreadPool> = OnceLock::new();
        GLOBAL.get_or_init(ThreadPool::new)
    }

    /// Spawn the workers and the timer service.
    ///
    /// Panics if the config is invalid (zero workers, or more workers
    /// than online cores) or if the pool was already started.
    pub fn start(&self, config: RuntimeConfig) {
        config.validate().expect("invalid runtime configuration");

        let mut state = self.shared.state.write().unwrap();
        match &*state {
            PoolState::Idle => {}
            PoolState::Running(_) => panic!("ThreadPool::start called twice"),
            PoolState::Stopped => panic!("ThreadPool::start after shutdown"),
        }

        let workers = (0..config.num_workers)
            .map(|i| Worker::spawn(i, config.spin_iters))
            .collect::<Vec<_>>();

        let timer = TimerService::start(self.clone());

        *state = PoolState::Running(PoolCore { workers, timer });
        nb_info!("pool started with {} workers", config.num_workers);
    }

    /// Dispatch a closure to the next worker in round-robin order.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_routine(Routine::call(f));
    }

    /// Dispatch a prepared routine to the next worker.
    pub fn schedule_routine(&self, r: Routine) {
        let state = self.shared.state.read().unwrap();
        let core = match &*state {
            PoolState::Running(core) => core,
            _ => panic!("schedule on a pool that is not running"),
        };

        let i = self.shared.cursor.fetch_add(1, Ordering::Relaxed) % core.workers.len();
        core.workers[i].push(r);
    }

    /// Dispatch `f` after `ms` milliseconds (monotonic clock).
    pub fn schedule_in<F>(&self, ms: u64, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.shared.state.read().unwrap();
        let core = match &*state {
            PoolState::Running(core) => core,
            _ => panic!("schedule_in on a pool that is not running"),
        };
        core.timer.schedule_in(ms, Routine::call(f));
    }

    /// Quiescence fence: run `f` only after every worker has started
    /// everything queued on it before this call.
    pub fn schedule_barrier<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.shared.state.read().unwrap();
        let core = match &*state {
            PoolState::Running(core) => core,
            _ => panic!("schedule_barrier on a pool that is not running"),
        };

        let barrier = Arc::new(BarrierState {
            pending: AtomicUsize::new(core.workers.len()),
            fenced: Mutex::new(Some(Routine::call(f))),
            pool: self.clone(),
        });

        for w in &core.workers {
            let b = barrier.clone();
            w.push(Routine::call(move || b.arrive()));
        }
    }

    /// Number of workers, or 0 when not running.
    pub fn num_workers(&self) -> usize {
        match &*self.shared.state.read().unwrap() {
            PoolState::Running(core) => core.workers.len(),
            _ => 0,
        }
    }

    /// Block the calling thread until a `wakeup` is delivered. Not
    /// callable from a worker (a worker must never block).
    ///
    /// Wakeups are counted, so one delivered just before `wait` is not
    /// lost.
    pub fn wait(&self) {
        assert!(
            current_worker_index().is_none(),
            "ThreadPool::wait called from a worker"
        );

        let mut permits = self.shared.wait_permits.lock().unwrap();
        while *permits == 0 {
            permits = self.shared.wait_cond.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    /// Release a thread blocked in `wait`, or the next one to arrive.
    pub fn wakeup(&self) {
        let mut permits = self.shared.wait_permits.lock().unwrap();
        *permits += 1;
        self.shared.wait_cond.notify_all();
    }

    /// Stop the timer service, then every worker in index order.
    ///
    /// Precondition: all queues have quiesced and no timers are
    /// pending. After shutdown no further scheduling is valid.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.write().unwrap();
        let core = match std::mem::replace(&mut *state, PoolState::Stopped) {
            PoolState::Running(core) => core,
            _ => panic!("shutdown on a pool that is not running"),
        };
        drop(state);

        let PoolCore { mut workers, mut timer } = core;
        timer.shutdown();
        for w in &mut workers {
            w.stop();
        }
        nb_info!("pool shut down");
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Countdown shared by one barrier's per-worker arrivals.
struct BarrierState {
    pending: AtomicUsize,
    fenced: Mutex<Option<Routine>>,
    pool: ThreadPool,
}

impl BarrierState {
    fn arrive(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let fenced = self
                .fenced
                .lock()
                .unwrap()
                .take()
                .expect("barrier completed twice");
            self.pool.schedule_routine(fenced);
        }
    }
}
