//! One-shot work items
//!
//! A `Routine` is the unit of dispatch: a closure plus its captured
//! state, invoked exactly once on some worker, with the storage released
//! after the call. The `Exit` variant is the distinguished sentinel a
//! worker's execute loop uses to unwind itself during shutdown.

/// A one-shot unit of work dispatched to a worker.
pub enum Routine {
    /// User work. Runs once; the box (and everything it captured) is
    /// dropped right after the call returns.
    Call(Box<dyn FnOnce() + Send + 'static>),

    /// Worker exit sentinel. Never runs user code; breaks the worker's
    /// execute loop. Pushed exactly once, by `Worker::stop`.
    Exit,
}

impl Routine {
    /// Wrap a closure as a schedulable routine.
    #[inline]
    pub fn call<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Routine::Call(Box::new(f))
    }

    /// True for the exit sentinel.
    #[inline]
    pub fn is_exit(&self) -> bool {
        matches!(self, Routine::Exit)
    }

    /// Run the routine, consuming it. Panics on the exit sentinel:
    /// only a worker's execute loop may observe `Exit`.
    pub fn run(self) {
        match self {
            Routine::Call(f) => f(),
            Routine::Exit => panic!("Routine::Exit must not be run"),
        }
    }
}

impl std::fmt::Debug for Routine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Routine::Call(_) => f.write_str("Routine::Call(..)"),
            Routine::Exit => f.write_str("Routine::Exit"),
        }
    }
}
