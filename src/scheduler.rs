//! Deferred task scheduling.
//!
//! The coordinator needs two kinds of timers: the empty-request timer and
//! the I/O timeout.  Both are one-shot, cancellable, and owned by exactly
//! one slot in the session state, so scheduling is modelled as "spawn a
//! sleeper, hand back a cancellation flag".  Cancellation is idempotent and
//! never interrupts a task that has already started running.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Executes deferred tasks.  A session uses the executor supplied in its
/// configuration, falling back to [`ThreadScheduler`].
pub trait TaskScheduler: Send + Sync {
    /// Run `task` after `delay` unless the returned handle is cancelled
    /// first.
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TaskHandle;
}

/// Cancellation handle for a scheduled task.
#[derive(Clone, Debug, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn new() -> Self {
        TaskHandle::default()
    }

    /// Prevent the task from firing if it has not fired yet.  Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Default scheduler: one sleeper thread per scheduled task.
///
/// Timers here are rare (at most two live per session) and coarse, so a
/// thread per timer is simpler than a shared timer wheel.
#[derive(Debug, Default)]
pub struct ThreadScheduler;

impl TaskScheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TaskHandle {
        let handle = TaskHandle::new();
        let flag = handle.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            if !flag.is_cancelled() {
                task();
            }
        });
        handle
    }
}
