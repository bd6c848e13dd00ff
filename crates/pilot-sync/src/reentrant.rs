//! Reentrant variant of the ticket lock.
//!
//! The holder may lock again without drawing a new ticket; only the
//! matching final unlock releases the native mutex (live) or advances the
//! serve counter (shadow). A shadow holder relocking while a live thread is
//! marked waits for that live thread first.

use crate::abort::AbortHandle;
use crate::backoff::SpinPolicy;
use crate::condition::TicketCondition;
use crate::ticket_lock::{impl_ticket_lockable, TicketCore, Wait};
use crate::Result;
use pilot_context as context;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct ReentrantTicketLock {
    core: Arc<TicketCore>,
}

impl ReentrantTicketLock {
    pub fn new(name: impl Into<String>, abort: AbortHandle) -> Self {
        Self::with_policy(name, abort, SpinPolicy::default())
    }

    pub fn with_policy(name: impl Into<String>, abort: AbortHandle, spin: SpinPolicy) -> Self {
        Self {
            core: Arc::new(TicketCore::new(name.into(), true, abort, spin)),
        }
    }

    pub fn lock(&self) -> Result<()> {
        let wait = if context::is_dry_run() {
            Wait::INTERRUPTIBLE
        } else {
            Wait::UNINTERRUPTIBLE
        };
        self.core.acquire(wait).map(|_| ())
    }

    /// Fails with [`SyncError::NotOwner`](crate::SyncError::NotOwner) when
    /// the calling thread holds nothing.
    pub fn unlock(&self) -> Result<()> {
        self.core.release()
    }

    pub fn try_lock(&self) -> Result<bool> {
        self.core.try_acquire()
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        self.core.acquire(Wait::until(Instant::now() + timeout))
    }

    pub fn lock_interruptibly(&self) -> Result<()> {
        self.core.acquire(Wait::INTERRUPTIBLE).map(|_| ())
    }

    pub fn new_condition(&self, name: &str) -> TicketCondition {
        TicketCondition::new(name, self.core.clone())
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.core.hold_count() > 0
    }

    /// Nested holds of the calling thread; 0 for any other thread.
    pub fn hold_count(&self) -> u32 {
        self.core.hold_count()
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
}

impl std::fmt::Debug for ReentrantTicketLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReentrantTicketLock")
            .field("name", &self.core.name())
            .field("ticket_dispenser", &self.ticket_dispenser())
            .field("next_serve_id", &self.next_serve_id())
            .finish()
    }
}

impl_ticket_lockable!(ReentrantTicketLock);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncError;
    use pilot_context::{with_mode, ExecutionMode, PilotId};
    use std::thread;

    #[test]
    fn test_live_nested_holds() {
        let lock = ReentrantTicketLock::new("nested", AbortHandle::disabled());
        for expected in 1..=3 {
            lock.lock().unwrap();
            assert_eq!(lock.hold_count(), expected);
        }
        assert_eq!(lock.ticket_dispenser(), 1);

        let other = lock.clone();
        assert_eq!(thread::spawn(move || other.hold_count()).join().unwrap(), 0);

        lock.unlock().unwrap();
        lock.unlock().unwrap();
        assert!(lock.is_held_by_current_thread());
        lock.unlock().unwrap();
        assert!(!lock.is_held_by_current_thread());
        assert_eq!(lock.ticket_dispenser(), 0);
        assert!(matches!(lock.unlock(), Err(SyncError::NotOwner)));
    }

    #[test]
    fn test_shadow_nested_holds_take_one_ticket() {
        let lock = ReentrantTicketLock::new("shadow-nested", AbortHandle::disabled());
        let _scope = with_mode(ExecutionMode::dry_run(PilotId(1), "test-host"));
        lock.lock().unwrap();
        assert!(lock.try_lock().unwrap());
        assert!(lock.try_lock_for(Duration::from_millis(10)).unwrap());
        assert_eq!(lock.hold_count(), 3);
        assert_eq!(lock.ticket_dispenser(), 1);

        lock.unlock().unwrap();
        lock.unlock().unwrap();
        assert_eq!(lock.next_serve_id(), 0);
        lock.unlock().unwrap();
        assert_eq!(lock.next_serve_id(), 1);
    }

    #[test]
    fn test_foreign_unlock_rejected() {
        let lock = ReentrantTicketLock::new("foreign", AbortHandle::disabled());
        lock.lock().unwrap();
        let other = lock.clone();
        let result = thread::spawn(move || other.unlock()).join().unwrap();
        assert!(matches!(result, Err(SyncError::NotOwner)));
        assert_eq!(lock.hold_count(), 1);
        lock.unlock().unwrap();
    }
}
