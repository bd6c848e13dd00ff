//! # pilot-sync
//!
//! Lock and condition wrappers that let a dry run replay the live
//! program's lock acquisition order without ever holding the real lock.
//!
//! Live threads go through a native pthread mutex. Shadow threads draw a
//! ticket and wait for their turn on two atomic counters. A live thread
//! that finds shadow tickets outstanding when it gets the native lock has
//! overtaken the dry run; that is reported once through the lock's
//! [`AbortHandle`] and the offending pilot is torn down by whoever drains
//! the channel.

pub mod abort;
pub mod backoff;
pub mod condition;
pub mod native;
pub mod reentrant;
pub mod ticket_lock;

pub use abort::{AbortHandle, AbortReason, AbortRequest};
pub use backoff::SpinPolicy;
pub use condition::TicketCondition;
pub use native::{MutexKind, NativeCondvar, NativeMutex};
pub use reentrant::ReentrantTicketLock;
pub use ticket_lock::{TicketLock, TicketLockable};

use pilot_context::{Interrupted, PilotId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("interrupted while waiting")]
    Interrupted,

    #[error("timed out while waiting")]
    Timeout,

    #[error("shadow signal reached a live waiter (pilot {pilot:?})")]
    Divergence { pilot: Option<PilotId> },

    #[error("lock is not held by the calling thread")]
    NotOwner,

    #[error("lock is already held by the calling thread")]
    Deadlock,

    #[error("native lock error: {0}")]
    Native(#[from] std::io::Error),
}

impl From<Interrupted> for SyncError {
    fn from(_: Interrupted) -> Self {
        SyncError::Interrupted
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

pub(crate) fn lock_unpoisoned<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
