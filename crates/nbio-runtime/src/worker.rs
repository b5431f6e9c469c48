//! Worker threads
//!
//! A worker is an OS thread that owns one `WorkQueue<Routine>` and runs
//! an execute loop: pop one routine, run it, repeat. The loop unwinds
//! when it pops the `Routine::Exit` sentinel, which `stop` pushes after
//! asserting the queue has quiesced. Routines are therefore never
//! interrupted mid-run; a worker can only leave the loop between items.

use nbio_core::{nb_debug, Routine, WorkQueue};
use std::cell::Cell;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

thread_local! {
    static CURRENT_WORKER_INDEX: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// The calling thread's worker index, if it is a pool worker.
#[inline]
pub fn current_worker_index() -> Option<usize> {
    let idx = CURRENT_WORKER_INDEX.with(|cell| cell.get());
    if idx == usize::MAX {
        None
    } else {
        Some(idx)
    }
}

/// One pool worker: stable index, OS thread, bounded-wait work queue.
pub struct Worker {
    index: usize,
    queue: Arc<WorkQueue<Routine>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn worker `index` with the given queue spin budget.
    pub fn spawn(index: usize, spin_iters: u32) -> Self {
        let queue = Arc::new(WorkQueue::with_spin(spin_iters));
        let q = queue.clone();

        let handle = thread::Builder::new()
            .name(format!("nbio-worker-{}", index))
            .spawn(move || {
                CURRENT_WORKER_INDEX.with(|cell| cell.set(index));
                execute_loop(index, &q);
            })
            .expect("failed to spawn worker thread");

        Self {
            index,
            queue,
            handle: Some(handle),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Enqueue a routine on this worker.
    #[inline]
    pub fn push(&self, r: Routine) {
        self.queue.push(r);
    }

    /// Momentary emptiness snapshot of this worker's queue.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Stop the worker: push the exit sentinel and join.
    ///
    /// Precondition: the queue has quiesced (no user work pending).
    pub fn stop(&mut self) {
        assert!(
            self.queue.is_empty(),
            "worker {} stopped with work still queued",
            self.index
        );

        self.queue.push(Routine::Exit);

        if let Some(handle) = self.handle.take() {
            handle.join().expect("worker thread panicked");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // stop() already joined in the normal path
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn execute_loop(index: usize, queue: &WorkQueue<Routine>) {
    nb_debug!("worker {} started", index);

    loop {
        match queue.pop() {
            Routine::Call(f) => f(),
            Routine::Exit => break,
        }
    }

    nb_debug!("worker {} exiting", index);
}
