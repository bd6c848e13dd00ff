//! Delayed and periodic work scheduled on behalf of a pilot.
//!
//! A [`PhantomTask`] runs on a phantom thread of its own. Cleaning the
//! pilot up cancels it: a task still waiting for its delay never runs, and
//! a periodic task stops after the current run.

use parking_lot::Mutex;
use pilot_context::PhantomThread;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Handle to scheduled phantom work. Clones refer to the same task.
#[derive(Clone)]
pub struct PhantomTask {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    name: String,
    cancelled: AtomicBool,
    finished: AtomicBool,
    runs: AtomicU64,
    /// Set once the worker thread starts.
    thread: Mutex<Option<PhantomThread>>,
}

impl PhantomTask {
    pub(crate) fn new(name: String) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                name,
                cancelled: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                runs: AtomicU64::new(0),
                thread: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Stop the task. A worker waiting for its next run is interrupted.
    /// Returns `false` if the task had already finished.
    pub fn cancel(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        self.inner.cancelled.store(true, Ordering::Release);
        let thread = self.inner.thread.lock();
        if let Some(thread) = thread.as_ref() {
            thread.interrupt();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Completed runs of the task's work.
    pub fn runs(&self) -> u64 {
        self.inner.runs.load(Ordering::Acquire)
    }

    /// Bind the task to the calling worker thread. A cancel that raced
    /// ahead of the bind interrupts the worker here.
    pub(crate) fn attach(&self) -> Finished {
        let me = PhantomThread::current();
        let mut slot = self.inner.thread.lock();
        if self.is_cancelled() {
            me.interrupt();
        }
        *slot = Some(me);
        Finished(self.clone())
    }

    pub(crate) fn record_run(&self) {
        self.inner.runs.fetch_add(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for PhantomTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhantomTask")
            .field("name", &self.inner.name)
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .field("runs", &self.runs())
            .finish()
    }
}

/// Marks the task finished when the worker returns or unwinds.
pub(crate) struct Finished(PhantomTask);

impl Drop for Finished {
    fn drop(&mut self) {
        self.0.inner.finished.store(true, Ordering::Release);
    }
}
