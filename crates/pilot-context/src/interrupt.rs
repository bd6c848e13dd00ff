//! Cooperative interruption for phantom threads.
//!
//! Every thread that touches this module gets a [`PhantomThread`] handle.
//! Interrupting sets a flag and unparks the thread; blocking primitives in
//! the pilot crates park with timeouts and poll [`is_interrupted`], so a
//! parked waiter notices within one park interval.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};
use thiserror::Error;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("thread interrupted")]
pub struct Interrupted;

#[derive(Debug)]
struct ThreadState {
    id: u64,
    interrupted: AtomicBool,
    alive: AtomicBool,
    thread: Thread,
}

impl ThreadState {
    fn for_current() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            interrupted: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            thread: thread::current(),
        })
    }
}

struct ThreadSlot(Arc<ThreadState>);

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        self.0.alive.store(false, Ordering::Release);
    }
}

thread_local! {
    static CURRENT_THREAD: ThreadSlot = ThreadSlot(ThreadState::for_current());
}

/// Shareable handle to a thread that can be interrupted from elsewhere.
#[derive(Debug, Clone)]
pub struct PhantomThread {
    inner: Arc<ThreadState>,
}

impl PhantomThread {
    /// Handle for the calling thread.
    pub fn current() -> Self {
        let inner = CURRENT_THREAD
            .try_with(|slot| slot.0.clone())
            .unwrap_or_else(|_| ThreadState::for_current());
        Self { inner }
    }

    /// Process-unique id, stable for the thread's lifetime.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.thread.name()
    }

    pub fn thread(&self) -> &Thread {
        &self.inner.thread
    }

    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
        self.inner.thread.unpark();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    /// False once the thread has exited.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    pub fn unpark(&self) {
        self.inner.thread.unpark();
    }

    pub fn same_thread(&self, other: &PhantomThread) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn take_interrupt(&self) -> bool {
        self.inner.interrupted.swap(false, Ordering::AcqRel)
    }
}

impl PartialEq for PhantomThread {
    fn eq(&self, other: &Self) -> bool {
        self.same_thread(other)
    }
}

impl Eq for PhantomThread {}

pub fn current_thread_id() -> u64 {
    PhantomThread::current().id()
}

/// Test and clear the calling thread's interrupt flag.
pub fn interrupted() -> bool {
    PhantomThread::current().take_interrupt()
}

/// Check the calling thread's interrupt flag without clearing it.
pub fn is_interrupted() -> bool {
    PhantomThread::current().is_interrupted()
}

/// Consume a pending interrupt as an error.
pub fn check_interrupt() -> Result<(), Interrupted> {
    if interrupted() {
        Err(Interrupted)
    } else {
        Ok(())
    }
}

/// Sleep for `duration` unless interrupted first. The flag is consumed on
/// the error path.
pub fn sleep_interruptibly(duration: Duration) -> Result<(), Interrupted> {
    let deadline = Instant::now() + duration;
    loop {
        check_interrupt()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::park_timeout(deadline - now);
    }
}
