//! Condition variable bound to a ticket lock.
//!
//! Waiters are kept in one FIFO, each tagged live or shadow. Live waiters
//! block on the native condvar and are woken by live signals. Shadow
//! waiters park and are woken only by shadow signals, which pop the queue
//! head. A shadow signal that pops a live waiter cannot wake it: that is a
//! micro fork, counted, logged and escalated through the lock's abort
//! handle.

use crate::abort::{AbortReason, AbortRequest};
use crate::native::NativeCondvar;
use crate::ticket_lock::{Side, TicketCore};
use crate::{lock_unpoisoned, Result, SyncError};
use pilot_config::log_lock_warn;
use pilot_context::{self as context, PhantomThread};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Longest a live waiter sleeps before rechecking its interrupt flag.
const LIVE_WAIT_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct WaitNode {
    thread: PhantomThread,
    phantom: bool,
    signalled: AtomicBool,
}

impl WaitNode {
    fn wake(&self) {
        self.signalled.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

pub struct TicketCondition {
    name: String,
    lock: Arc<TicketCore>,
    queue: Mutex<VecDeque<Arc<WaitNode>>>,
    native: NativeCondvar,
    fork_events: AtomicU64,
}

impl TicketCondition {
    pub(crate) fn new(name: &str, lock: Arc<TicketCore>) -> Self {
        Self {
            name: format!("{}/{}", lock.name(), name),
            lock,
            queue: Mutex::new(VecDeque::new()),
            native: NativeCondvar::new(),
            fork_events: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock, wait for a signal, reacquire. The caller must hold
    /// the lock. Spurious returns are possible in live mode.
    pub fn await_signal(&self) -> Result<()> {
        self.wait_until(None).map(|_| ())
    }

    /// Like [`await_signal`](Self::await_signal); `Ok(false)` on timeout.
    pub fn await_timeout(&self, timeout: Duration) -> Result<bool> {
        self.wait_until(Some(Instant::now() + timeout))
    }

    pub fn signal(&self) -> Result<()> {
        if !context::is_dry_run() {
            self.native.signal();
            return Ok(());
        }
        let Some(node) = lock_unpoisoned(&self.queue).pop_front() else {
            return Ok(());
        };
        if node.phantom {
            node.wake();
            Ok(())
        } else {
            Err(self.micro_fork(1))
        }
    }

    /// In dry-run mode every shadow waiter is woken before a divergence
    /// caused by live waiters is reported.
    pub fn signal_all(&self) -> Result<()> {
        if !context::is_dry_run() {
            self.native.broadcast();
            return Ok(());
        }
        let drained: Vec<_> = lock_unpoisoned(&self.queue).drain(..).collect();
        let mut live_waiters = 0;
        for node in drained {
            if node.phantom {
                node.wake();
            } else {
                live_waiters += 1;
            }
        }
        if live_waiters > 0 {
            Err(self.micro_fork(live_waiters))
        } else {
            Ok(())
        }
    }

    pub fn waiting(&self) -> usize {
        lock_unpoisoned(&self.queue).len()
    }

    /// Live waiters popped by shadow signals so far.
    pub fn fork_events(&self) -> u64 {
        self.fork_events.load(Ordering::Relaxed)
    }

    fn micro_fork(&self, live_waiters: u64) -> SyncError {
        self.fork_events.fetch_add(live_waiters, Ordering::Relaxed);
        let pilot = context::current_pilot();
        log_lock_warn!(
            "Micro fork: shadow signal reached a live waiter",
            condition = %self.name,
            pilot = ?pilot,
            live_waiters
        );
        self.lock.abort_handle().request(AbortRequest {
            pilot,
            reason: AbortReason::Divergence {
                condition: self.name.clone(),
            },
        });
        SyncError::Divergence { pilot }
    }

    fn enqueue(&self, phantom: bool) -> Arc<WaitNode> {
        let node = Arc::new(WaitNode {
            thread: PhantomThread::current(),
            phantom,
            signalled: AtomicBool::new(false),
        });
        lock_unpoisoned(&self.queue).push_back(node.clone());
        node
    }

    /// `false` if a signaller already popped the node.
    fn dequeue(&self, node: &Arc<WaitNode>) -> bool {
        let mut queue = lock_unpoisoned(&self.queue);
        match queue.iter().position(|queued| Arc::ptr_eq(queued, node)) {
            Some(index) => {
                queue.remove(index);
                true
            }
            None => false,
        }
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Result<bool> {
        context::check_interrupt()?;
        let node = self.enqueue(context::is_dry_run());
        let suspension = match self.lock.suspend() {
            Ok(suspension) => suspension,
            Err(err) => {
                self.dequeue(&node);
                return Err(err);
            }
        };
        match suspension.side {
            Side::Live => {
                let outcome = self.park_live(deadline);
                self.dequeue(&node);
                self.lock.resume(suspension)?;
                outcome
            }
            Side::Shadow => {
                let mut outcome = self.park_shadow(&node, deadline);
                if !matches!(outcome, Ok(true)) && !self.dequeue(&node) {
                    // Popped by a signaller at the last moment; keep the
                    // signal and leave any interrupt pending.
                    if matches!(outcome, Err(SyncError::Interrupted)) {
                        node.thread.interrupt();
                    }
                    outcome = Ok(true);
                }
                self.lock.resume(suspension)?;
                outcome
            }
        }
    }

    fn park_live(&self, deadline: Option<Instant>) -> Result<bool> {
        loop {
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    (deadline - now).min(LIVE_WAIT_SLICE)
                }
                None => LIVE_WAIT_SLICE,
            };
            // SAFETY: suspend() only cleared the bookkeeping; this thread
            // still holds the native mutex exactly once.
            if unsafe { self.native.wait_timeout(self.lock.native(), slice) }? {
                return Ok(true);
            }
            if context::interrupted() {
                return Err(SyncError::Interrupted);
            }
        }
    }

    fn park_shadow(&self, node: &WaitNode, deadline: Option<Instant>) -> Result<bool> {
        loop {
            if node.signalled.load(Ordering::Acquire) {
                return Ok(true);
            }
            if context::interrupted() {
                return Err(SyncError::Interrupted);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }
    }
}

impl std::fmt::Debug for TicketCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketCondition")
            .field("name", &self.name)
            .field("waiting", &self.waiting())
            .field("fork_events", &self.fork_events())
            .finish()
    }
}
