//! Ticket-ordered lock shared by live and shadow threads.
//!
//! Counters:
//! - `ticket_dispenser`: tickets handed out (shadow) plus one per live holder
//! - `next_serve_id`: ticket currently allowed to run
//! - `delegate_is_locked`: live threads that have claimed or hold the
//!   native mutex
//!
//! `next_serve_id <= ticket_dispenser` always holds. A live thread that gets
//! the native mutex while `ticket_dispenser > next_serve_id` has overtaken
//! the dry run and raises exactly one abort request.

use crate::abort::{AbortHandle, AbortReason, AbortRequest};
use crate::backoff::SpinPolicy;
use crate::condition::TicketCondition;
use crate::native::{MutexKind, NativeMutex};
use crate::{lock_unpoisoned, Result, SyncError};
use pilot_config::{log_lock_debug, log_lock_warn};
use pilot_context::{self as context, PilotId};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Common surface of [`TicketLock`] and
/// [`ReentrantTicketLock`](crate::ReentrantTicketLock).
pub trait TicketLockable: Send + Sync {
    /// Block until acquired. In dry-run mode an interrupt cancels the wait
    /// and releases the drawn ticket.
    fn lock(&self) -> Result<()>;
    fn unlock(&self) -> Result<()>;
    fn try_lock(&self) -> Result<bool>;
    fn try_lock_for(&self, timeout: Duration) -> Result<bool>;
    fn lock_interruptibly(&self) -> Result<()>;
    fn new_condition(&self, name: &str) -> TicketCondition;
    fn ticket_dispenser(&self) -> u64;
    fn next_serve_id(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Live,
    Shadow,
}

/// Thread currently holding one side of the lock, with its hold count.
#[derive(Debug, Default)]
struct Holder {
    owner: AtomicU64,
    count: AtomicU32,
}

impl Holder {
    fn is_held_by(&self, thread: u64) -> bool {
        self.owner.load(Ordering::Acquire) == thread
    }

    fn claim(&self, thread: u64, count: u32) {
        self.count.store(count, Ordering::Relaxed);
        self.owner.store(thread, Ordering::Release);
    }

    fn clear(&self) -> u32 {
        self.owner.store(0, Ordering::Release);
        self.count.swap(0, Ordering::Relaxed)
    }
}

/// Saved hold state while a condition waiter is parked.
#[derive(Debug)]
pub(crate) struct Suspension {
    pub(crate) side: Side,
    count: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Wait {
    deadline: Option<Instant>,
    interruptible: bool,
}

impl Wait {
    pub(crate) const UNINTERRUPTIBLE: Wait = Wait {
        deadline: None,
        interruptible: false,
    };
    pub(crate) const INTERRUPTIBLE: Wait = Wait {
        deadline: None,
        interruptible: true,
    };

    pub(crate) fn until(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            interruptible: true,
        }
    }

    fn blocks_forever(&self) -> bool {
        self.deadline.is_none() && !self.interruptible
    }

    /// `Ok(false)` once the deadline has passed. Consumes a pending interrupt.
    fn poll(&self) -> Result<bool> {
        if self.interruptible {
            context::check_interrupt()?;
        }
        Ok(self.deadline.map_or(true, |deadline| Instant::now() < deadline))
    }
}

pub(crate) struct TicketCore {
    name: String,
    reentrant: bool,
    ticket_dispenser: AtomicU64,
    next_serve_id: AtomicU64,
    delegate_is_locked: AtomicUsize,
    /// Serializes marking a live thread against drawing a shadow ticket,
    /// so a drawn ticket never absorbs a live holder's increment.
    gate: Mutex<()>,
    native: NativeMutex,
    /// Tickets given up by timed-out or interrupted waiters behind the
    /// current one; the serve counter skips them.
    abandoned: Mutex<BTreeSet<u64>>,
    shadow_pilot: Mutex<Option<PilotId>>,
    live: Holder,
    shadow: Holder,
    abort: AbortHandle,
    spin: SpinPolicy,
}

impl TicketCore {
    pub(crate) fn new(name: String, reentrant: bool, abort: AbortHandle, spin: SpinPolicy) -> Self {
        let kind = if reentrant {
            MutexKind::Recursive
        } else {
            MutexKind::ErrorCheck
        };
        Self {
            name,
            reentrant,
            ticket_dispenser: AtomicU64::new(0),
            next_serve_id: AtomicU64::new(0),
            delegate_is_locked: AtomicUsize::new(0),
            gate: Mutex::new(()),
            native: NativeMutex::new(kind),
            abandoned: Mutex::new(BTreeSet::new()),
            shadow_pilot: Mutex::new(None),
            live: Holder::default(),
            shadow: Holder::default(),
            abort,
            spin,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn native(&self) -> &NativeMutex {
        &self.native
    }

    pub(crate) fn abort_handle(&self) -> &AbortHandle {
        &self.abort
    }

    pub(crate) fn ticket_dispenser(&self) -> u64 {
        self.ticket_dispenser.load(Ordering::SeqCst)
    }

    pub(crate) fn next_serve_id(&self) -> u64 {
        self.next_serve_id.load(Ordering::SeqCst)
    }

    pub(crate) fn is_delegate_locked(&self) -> bool {
        self.delegate_is_locked.load(Ordering::SeqCst) != 0
    }

    fn holder(&self, side: Side) -> &Holder {
        match side {
            Side::Live => &self.live,
            Side::Shadow => &self.shadow,
        }
    }

    fn current_side() -> Side {
        if context::is_dry_run() {
            Side::Shadow
        } else {
            Side::Live
        }
    }

    /// Hold count of the calling thread on whichever side it holds.
    pub(crate) fn hold_count(&self) -> u32 {
        let me = context::current_thread_id();
        [&self.live, &self.shadow]
            .into_iter()
            .find(|holder| holder.is_held_by(me))
            .map_or(0, |holder| holder.count.load(Ordering::Relaxed))
    }

    pub(crate) fn acquire(&self, wait: Wait) -> Result<bool> {
        let me = context::current_thread_id();
        match Self::current_side() {
            Side::Live => self.live_acquire(me, wait),
            Side::Shadow => self.shadow_acquire(me, wait),
        }
    }

    pub(crate) fn try_acquire(&self) -> Result<bool> {
        let me = context::current_thread_id();
        match Self::current_side() {
            Side::Live => {
                if self.live.is_held_by(me) {
                    return Ok(self.reenter(&self.live));
                }
                self.mark_live();
                if self.native.try_lock() {
                    self.enter_live(me, 1);
                    Ok(true)
                } else {
                    self.delegate_is_locked.fetch_sub(1, Ordering::SeqCst);
                    Ok(false)
                }
            }
            Side::Shadow => {
                if self.shadow.is_held_by(me) {
                    return Ok(!self.is_delegate_locked() && self.reenter(&self.shadow));
                }
                let _gate = lock_unpoisoned(&self.gate);
                if self.is_delegate_locked() {
                    return Ok(false);
                }
                let served = self.next_serve_id.load(Ordering::SeqCst);
                if self
                    .ticket_dispenser
                    .compare_exchange(served, served + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    *lock_unpoisoned(&self.shadow_pilot) = context::current_pilot();
                    self.shadow.claim(me, 1);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn reenter(&self, holder: &Holder) -> bool {
        if self.reentrant {
            holder.count.fetch_add(1, Ordering::Relaxed);
        }
        self.reentrant
    }

    fn live_acquire(&self, me: u64, wait: Wait) -> Result<bool> {
        if self.live.is_held_by(me) {
            return if self.reenter(&self.live) {
                Ok(true)
            } else {
                Err(SyncError::Deadlock)
            };
        }
        if wait.interruptible {
            context::check_interrupt()?;
        }

        self.mark_live();
        match self.lock_native(wait) {
            Ok(true) => {
                self.enter_live(me, 1);
                Ok(true)
            }
            other => {
                self.delegate_is_locked.fetch_sub(1, Ordering::SeqCst);
                other
            }
        }
    }

    fn lock_native(&self, wait: Wait) -> Result<bool> {
        if wait.blocks_forever() {
            self.native.lock()?;
            return Ok(true);
        }
        let spinner = self.spin.spinner();
        loop {
            if self.native.try_lock() {
                return Ok(true);
            }
            if !wait.poll()? {
                return Ok(false);
            }
            spinner.wait();
        }
    }

    /// Bookkeeping once the native mutex is held.
    fn enter_live(&self, me: u64, count: u32) {
        self.check_ordering();
        self.ticket_dispenser.fetch_add(1, Ordering::SeqCst);
        self.live.claim(me, count);
    }

    fn check_ordering(&self) {
        let dispensed = self.ticket_dispenser.load(Ordering::SeqCst);
        let served = self.next_serve_id.load(Ordering::SeqCst);
        if dispensed > served {
            let pilot = *lock_unpoisoned(&self.shadow_pilot);
            log_lock_warn!(
                "Ordering violation: live thread overtook outstanding shadow tickets",
                lock = %self.name,
                dispensed,
                served,
                pilot = ?pilot
            );
            self.abort.request(AbortRequest {
                pilot,
                reason: AbortReason::OrderingViolation {
                    lock: self.name.clone(),
                },
            });
        }
    }

    fn shadow_acquire(&self, me: u64, wait: Wait) -> Result<bool> {
        if self.shadow.is_held_by(me) {
            if !self.reentrant {
                return Err(SyncError::Deadlock);
            }
            if !self.await_live_release(wait)? {
                return Ok(false);
            }
            self.shadow.count.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }

        let Some(ticket) = self.draw_ticket(wait)? else {
            return Ok(false);
        };
        match self.await_turn(ticket, wait) {
            Ok(true) => {
                self.shadow.claim(me, 1);
                Ok(true)
            }
            other => {
                self.release_ticket(ticket);
                other
            }
        }
    }

    /// A ticket is only drawn while no live thread is marked; a live thread
    /// that slips in between sees the outstanding ticket as a violation.
    fn draw_ticket(&self, wait: Wait) -> Result<Option<u64>> {
        let spinner = self.spin.spinner();
        loop {
            if !wait.poll()? {
                return Ok(None);
            }
            if let Some(ticket) = self.try_draw() {
                log_lock_debug!("Shadow ticket drawn", lock = %self.name, ticket);
                return Ok(Some(ticket));
            }
            spinner.wait();
        }
    }

    fn try_draw(&self) -> Option<u64> {
        let _gate = lock_unpoisoned(&self.gate);
        if self.is_delegate_locked() {
            return None;
        }
        let ticket = self.ticket_dispenser.fetch_add(1, Ordering::SeqCst);
        *lock_unpoisoned(&self.shadow_pilot) = context::current_pilot();
        Some(ticket)
    }

    fn mark_live(&self) {
        let _gate = lock_unpoisoned(&self.gate);
        self.delegate_is_locked.fetch_add(1, Ordering::SeqCst);
    }

    fn await_turn(&self, ticket: u64, wait: Wait) -> Result<bool> {
        let spinner = self.spin.spinner();
        while self.next_serve_id.load(Ordering::SeqCst) != ticket {
            if !wait.poll()? {
                return Ok(false);
            }
            spinner.wait();
        }
        self.await_live_release(wait)
    }

    fn await_live_release(&self, wait: Wait) -> Result<bool> {
        let spinner = self.spin.spinner();
        while self.is_delegate_locked() {
            if !wait.poll()? {
                return Ok(false);
            }
            spinner.wait();
        }
        Ok(true)
    }

    /// Give back a ticket that never entered the critical section.
    fn release_ticket(&self, ticket: u64) {
        let mut abandoned = lock_unpoisoned(&self.abandoned);
        if self.next_serve_id.load(Ordering::SeqCst) == ticket {
            self.advance_serve_locked(&mut abandoned);
        } else if self
            .ticket_dispenser
            .compare_exchange(ticket + 1, ticket, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            abandoned.insert(ticket);
        }
        log_lock_debug!("Shadow ticket released unused", lock = %self.name, ticket);
    }

    fn advance_serve(&self) {
        let mut abandoned = lock_unpoisoned(&self.abandoned);
        self.advance_serve_locked(&mut abandoned);
    }

    fn advance_serve_locked(&self, abandoned: &mut BTreeSet<u64>) {
        let mut next = self.next_serve_id.fetch_add(1, Ordering::SeqCst) + 1;
        while abandoned.remove(&next) {
            next = self.next_serve_id.fetch_add(1, Ordering::SeqCst) + 1;
        }
    }

    pub(crate) fn release(&self) -> Result<()> {
        let me = context::current_thread_id();
        let order = match Self::current_side() {
            Side::Live => [Side::Live, Side::Shadow],
            Side::Shadow => [Side::Shadow, Side::Live],
        };
        for side in order {
            let holder = self.holder(side);
            if !holder.is_held_by(me) {
                continue;
            }
            if holder.count.fetch_sub(1, Ordering::Relaxed) > 1 {
                return Ok(());
            }
            holder.clear();
            return match side {
                Side::Live => self.live_release(),
                Side::Shadow => {
                    self.advance_serve();
                    Ok(())
                }
            };
        }
        Err(SyncError::NotOwner)
    }

    fn live_release(&self) -> Result<()> {
        self.ticket_dispenser.fetch_sub(1, Ordering::SeqCst);
        self.delegate_is_locked.fetch_sub(1, Ordering::SeqCst);
        self.native.unlock()?;
        Ok(())
    }

    /// Drop every hold of the calling thread without touching the native
    /// mutex, which a live condition wait releases itself.
    pub(crate) fn suspend(&self) -> Result<Suspension> {
        let me = context::current_thread_id();
        let side = Self::current_side();
        let holder = self.holder(side);
        if !holder.is_held_by(me) {
            return Err(SyncError::NotOwner);
        }
        let count = holder.clear();
        match side {
            Side::Live => {
                self.ticket_dispenser.fetch_sub(1, Ordering::SeqCst);
                self.delegate_is_locked.fetch_sub(1, Ordering::SeqCst);
            }
            Side::Shadow => self.advance_serve(),
        }
        Ok(Suspension { side, count })
    }

    /// Restore a suspended hold. A live caller must already hold the
    /// native mutex again; a shadow caller queues for a fresh ticket.
    pub(crate) fn resume(&self, suspension: Suspension) -> Result<()> {
        let me = context::current_thread_id();
        match suspension.side {
            Side::Live => {
                self.mark_live();
                self.enter_live(me, suspension.count);
            }
            Side::Shadow => {
                self.shadow_acquire(me, Wait::UNINTERRUPTIBLE)?;
                self.shadow.count.store(suspension.count, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

/// Non-reentrant ticket lock. Cloning yields another handle to the same lock.
#[derive(Clone)]
pub struct TicketLock {
    core: Arc<TicketCore>,
}

impl TicketLock {
    pub fn new(name: impl Into<String>, abort: AbortHandle) -> Self {
        Self::with_policy(name, abort, SpinPolicy::default())
    }

    pub fn with_policy(name: impl Into<String>, abort: AbortHandle, spin: SpinPolicy) -> Self {
        Self {
            core: Arc::new(TicketCore::new(name.into(), false, abort, spin)),
        }
    }

    /// Relocking from the holding thread fails with [`SyncError::Deadlock`].
    pub fn lock(&self) -> Result<()> {
        let wait = if context::is_dry_run() {
            Wait::INTERRUPTIBLE
        } else {
            Wait::UNINTERRUPTIBLE
        };
        self.core.acquire(wait).map(|_| ())
    }

    pub fn unlock(&self) -> Result<()> {
        self.core.release()
    }

    pub fn try_lock(&self) -> Result<bool> {
        self.core.try_acquire()
    }

    /// `Ok(false)` on timeout; the claimed ticket is released.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        self.core.acquire(Wait::until(Instant::now() + timeout))
    }

    pub fn lock_interruptibly(&self) -> Result<()> {
        self.core.acquire(Wait::INTERRUPTIBLE).map(|_| ())
    }

    pub fn new_condition(&self, name: &str) -> TicketCondition {
        TicketCondition::new(name, self.core.clone())
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn ticket_dispenser(&self) -> u64 {
        self.core.ticket_dispenser()
    }

    pub fn next_serve_id(&self) -> u64 {
        self.core.next_serve_id()
    }

    pub fn is_delegate_locked(&self) -> bool {
        self.core.is_delegate_locked()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.core.hold_count() > 0
    }
}

impl std::fmt::Debug for TicketLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketLock")
            .field("name", &self.core.name())
            .field("ticket_dispenser", &self.ticket_dispenser())
            .field("next_serve_id", &self.next_serve_id())
            .field("delegate_is_locked", &self.is_delegate_locked())
            .finish()
    }
}

macro_rules! impl_ticket_lockable {
    ($ty:ty) => {
        impl $crate::ticket_lock::TicketLockable for $ty {
            fn lock(&self) -> $crate::Result<()> {
                <$ty>::lock(self)
            }
            fn unlock(&self) -> $crate::Result<()> {
                <$ty>::unlock(self)
            }
            fn try_lock(&self) -> $crate::Result<bool> {
                <$ty>::try_lock(self)
            }
            fn try_lock_for(&self, timeout: ::std::time::Duration) -> $crate::Result<bool> {
                <$ty>::try_lock_for(self, timeout)
            }
            fn lock_interruptibly(&self) -> $crate::Result<()> {
                <$ty>::lock_interruptibly(self)
            }
            fn new_condition(&self, name: &str) -> $crate::condition::TicketCondition {
                <$ty>::new_condition(self, name)
            }
            fn ticket_dispenser(&self) -> u64 {
                <$ty>::ticket_dispenser(self)
            }
            fn next_serve_id(&self) -> u64 {
                <$ty>::next_serve_id(self)
            }
        }
    };
}

pub(crate) use impl_ticket_lockable;

impl_ticket_lockable!(TicketLock);

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::TryRecvError;
    use pilot_context::{with_mode, ExecutionMode, PhantomThread};
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn dry_run(pilot: u64) -> ExecutionMode {
        ExecutionMode::dry_run(PilotId(pilot), "test-host")
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_live_lock_balances_counters() {
        let lock = TicketLock::new("live", AbortHandle::disabled());
        lock.lock().unwrap();
        assert_eq!(lock.ticket_dispenser(), 1);
        assert!(lock.is_delegate_locked());
        assert!(lock.is_held_by_current_thread());
        lock.unlock().unwrap();
        assert_eq!(lock.ticket_dispenser(), 0);
        assert_eq!(lock.next_serve_id(), 0);
        assert!(!lock.is_delegate_locked());
    }

    #[test]
    fn test_shadow_lock_advances_serve() {
        let lock = TicketLock::new("shadow", AbortHandle::disabled());
        let _scope = with_mode(dry_run(1));
        lock.lock().unwrap();
        assert_eq!(lock.ticket_dispenser(), 1);
        assert_eq!(lock.next_serve_id(), 0);
        assert!(!lock.is_delegate_locked());
        lock.unlock().unwrap();
        assert_eq!(lock.next_serve_id(), 1);
    }

    #[test]
    fn test_unlock_without_holding() {
        let lock = TicketLock::new("owner", AbortHandle::disabled());
        assert!(matches!(lock.unlock(), Err(SyncError::NotOwner)));

        lock.lock().unwrap();
        let other = lock.clone();
        let result = thread::spawn(move || other.unlock()).join().unwrap();
        assert!(matches!(result, Err(SyncError::NotOwner)));
        lock.unlock().unwrap();
    }

    #[test]
    fn test_relock_reports_deadlock() {
        let lock = TicketLock::new("relock", AbortHandle::disabled());
        lock.lock().unwrap();
        assert!(matches!(lock.lock(), Err(SyncError::Deadlock)));
        assert!(!lock.try_lock().unwrap());
        lock.unlock().unwrap();
    }

    #[test]
    fn test_forced_violation_aborts_exactly_once() {
        let (abort, rx) = AbortHandle::channel();
        let lock = TicketLock::new("forced", abort);
        lock.core.ticket_dispenser.store(1, Ordering::SeqCst);
        *lock_unpoisoned(&lock.core.shadow_pilot) = Some(PilotId(42));

        lock.lock().unwrap();
        let request = rx.try_recv().unwrap();
        assert_eq!(request.pilot, Some(PilotId(42)));
        assert_eq!(
            request.reason,
            AbortReason::OrderingViolation {
                lock: "forced".into()
            }
        );
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        lock.unlock().unwrap();
        assert_eq!(lock.ticket_dispenser(), 1);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_no_violation_in_pure_live_use() {
        let (abort, rx) = AbortHandle::channel();
        let lock = TicketLock::new("quiet", abort);
        for _ in 0..10 {
            lock.lock().unwrap();
            lock.unlock().unwrap();
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_live_overtaking_shadow_holder_is_reported() {
        let (abort, rx) = AbortHandle::channel();
        let lock = TicketLock::new("overtake", abort);
        let shadow = lock.clone();
        let (held_tx, held_rx) = crossbeam_channel::bounded(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

        let holder = thread::spawn(move || {
            let _scope = with_mode(dry_run(7));
            shadow.lock().unwrap();
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            shadow.unlock().unwrap();
        });
        held_rx.recv().unwrap();

        lock.lock().unwrap();
        assert_eq!(rx.try_recv().unwrap().pilot, Some(PilotId(7)));
        lock.unlock().unwrap();

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_eq!(lock.ticket_dispenser(), lock.next_serve_id());
    }

    #[test]
    fn test_shadow_waits_for_live_holder() {
        let (abort, rx) = AbortHandle::channel();
        let lock = TicketLock::new("waits", abort);
        lock.lock().unwrap();

        let entered = Arc::new(AtomicBool::new(false));
        let (shadow, flag) = (lock.clone(), entered.clone());
        let waiter = thread::spawn(move || {
            let _scope = with_mode(dry_run(3));
            shadow.lock().unwrap();
            flag.store(true, Ordering::SeqCst);
            shadow.unlock().unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        lock.unlock().unwrap();
        waiter.join().unwrap();

        assert!(entered.load(Ordering::SeqCst));
        assert!(rx.try_recv().is_err());
        assert_eq!(lock.ticket_dispenser(), 1);
        assert_eq!(lock.next_serve_id(), 1);
    }

    #[test]
    fn test_shadow_try_lock() {
        let lock = TicketLock::new("try", AbortHandle::disabled());
        let _scope = with_mode(dry_run(1));
        assert!(lock.try_lock().unwrap());

        let other = lock.clone();
        let got = thread::spawn(move || {
            let _scope = with_mode(dry_run(1));
            other.try_lock().unwrap()
        })
        .join()
        .unwrap();
        assert!(!got);
        assert_eq!(lock.ticket_dispenser(), 1);
        lock.unlock().unwrap();
    }

    #[test]
    fn test_shadow_timeout_returns_ticket() {
        let lock = TicketLock::new("timeout", AbortHandle::disabled());
        let _scope = with_mode(dry_run(1));
        lock.lock().unwrap();

        let other = lock.clone();
        let got = thread::spawn(move || {
            let _scope = with_mode(dry_run(1));
            other.try_lock_for(Duration::from_millis(30)).unwrap()
        })
        .join()
        .unwrap();
        assert!(!got);
        assert_eq!(lock.ticket_dispenser(), 1);

        lock.unlock().unwrap();
        assert_eq!(lock.next_serve_id(), 1);
    }

    #[test]
    fn test_interrupted_shadow_wait_releases_ticket() {
        let lock = TicketLock::new("interrupt", AbortHandle::disabled());
        let _scope = with_mode(dry_run(1));
        lock.lock().unwrap();

        let (handle_tx, handle_rx) = crossbeam_channel::bounded(1);
        let other = lock.clone();
        let waiter = thread::spawn(move || {
            let _scope = with_mode(dry_run(1));
            handle_tx.send(PhantomThread::current()).unwrap();
            other.lock()
        });
        let target = handle_rx.recv().unwrap();
        let observer = lock.clone();
        wait_for(|| observer.ticket_dispenser() == 2);
        target.interrupt();

        assert!(matches!(waiter.join().unwrap(), Err(SyncError::Interrupted)));
        assert_eq!(lock.ticket_dispenser(), 1);
        lock.unlock().unwrap();
        assert_eq!(lock.ticket_dispenser(), lock.next_serve_id());
    }

    #[test]
    fn test_abandoned_ticket_is_skipped() {
        let lock = TicketLock::new("skip", AbortHandle::disabled());
        let _scope = with_mode(dry_run(1));
        lock.lock().unwrap();

        let timed = lock.clone();
        let quitter = thread::spawn(move || {
            let _scope = with_mode(dry_run(1));
            timed.try_lock_for(Duration::from_millis(200)).unwrap()
        });
        let observer = lock.clone();
        wait_for(|| observer.ticket_dispenser() == 2);

        let patient = lock.clone();
        let entered = Arc::new(AtomicBool::new(false));
        let flag = entered.clone();
        let stayer = thread::spawn(move || {
            let _scope = with_mode(dry_run(1));
            patient.lock().unwrap();
            flag.store(true, Ordering::SeqCst);
            patient.unlock().unwrap();
        });
        wait_for(|| observer.ticket_dispenser() == 3);

        assert!(!quitter.join().unwrap());
        assert_eq!(lock.ticket_dispenser(), 3);

        lock.unlock().unwrap();
        stayer.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert_eq!(lock.next_serve_id(), 3);
        assert_eq!(lock.ticket_dispenser(), 3);
    }
}
