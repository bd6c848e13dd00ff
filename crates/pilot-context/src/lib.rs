//! # pilot-context
//!
//! Carries the live/dry-run flag and the pilot identifier along with the
//! logical task, and provides the interruption handles used to cancel
//! phantom threads.
//!
//! The mode is thread-local. Crossing a thread boundary requires either
//! [`wrap`] (for plain closures) or a [`Resumable`] implementation; both
//! capture the mode on the spawning side and re-enter it on the worker.

pub mod interrupt;

pub use interrupt::{
    check_interrupt, current_thread_id, interrupted, is_interrupted, sleep_interruptibly,
    Interrupted, PhantomThread,
};

use once_cell::sync::Lazy;
use pilot_config::log_context_debug;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::num::ParseIntError;
use std::str::FromStr;
use std::sync::Arc;

/// Identifier of one dry run. Rendered as the decimal node name under the
/// coordination service's pilot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PilotId(pub u64);

impl PilotId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PilotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PilotId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(PilotId)
    }
}

impl From<u64> for PilotId {
    fn from(value: u64) -> Self {
        PilotId(value)
    }
}

/// Live vs. dry-run flag plus the identity of the owning pilot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionMode {
    pub is_dry_run: bool,
    /// `None` for live execution
    pub pilot_id: Option<PilotId>,
    pub host_identifier: String,
}

impl ExecutionMode {
    pub fn live() -> Self {
        Self {
            is_dry_run: false,
            pilot_id: None,
            host_identifier: host_identifier(),
        }
    }

    pub fn dry_run(pilot_id: PilotId, host_identifier: impl Into<String>) -> Self {
        Self {
            is_dry_run: true,
            pilot_id: Some(pilot_id),
            host_identifier: host_identifier.into(),
        }
    }
}

static LIVE_MODE: Lazy<Arc<ExecutionMode>> = Lazy::new(|| Arc::new(ExecutionMode::live()));

thread_local! {
    static CURRENT_MODE: RefCell<Option<Arc<ExecutionMode>>> = const { RefCell::new(None) };
}

/// Mode of the calling thread; live when nothing was entered.
pub fn current() -> Arc<ExecutionMode> {
    CURRENT_MODE
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten()
        .unwrap_or_else(|| LIVE_MODE.clone())
}

pub fn is_dry_run() -> bool {
    CURRENT_MODE
        .try_with(|slot| slot.borrow().as_ref().is_some_and(|m| m.is_dry_run))
        .unwrap_or(false)
}

pub fn current_pilot() -> Option<PilotId> {
    CURRENT_MODE
        .try_with(|slot| slot.borrow().as_ref().and_then(|m| m.pilot_id))
        .ok()
        .flatten()
}

/// Enter `mode` on the calling thread until the returned scope drops.
///
/// Scopes nest: dropping restores whatever was current before.
pub fn with_mode(mode: impl Into<Arc<ExecutionMode>>) -> ModeScope {
    let mode = mode.into();
    log_context_debug!(
        "Entering execution mode",
        dry_run = mode.is_dry_run,
        pilot = ?mode.pilot_id
    );
    let previous = CURRENT_MODE.with(|slot| slot.borrow_mut().replace(mode));
    ModeScope {
        previous,
        _not_send: PhantomData,
    }
}

/// Restores the previous mode on drop. Bound to the thread that created it.
#[must_use = "the mode is left as soon as the scope is dropped"]
pub struct ModeScope {
    previous: Option<Arc<ExecutionMode>>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ModeScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = CURRENT_MODE.try_with(|slot| *slot.borrow_mut() = previous);
    }
}

/// Capture the caller's mode and re-enter it wherever the closure runs.
pub fn wrap<F, R>(f: F) -> impl FnOnce() -> R + Send + 'static
where
    F: FnOnce() -> R + Send + 'static,
{
    let mode = current();
    move || {
        let _scope = with_mode(mode);
        f()
    }
}

/// A unit of work that can be handed a mode before it starts running on
/// another thread.
///
/// Types that keep their own copy of the mode (instead of relying on the
/// thread-local) implement this to store it; closures get it for free.
pub trait Resumable: Send + 'static {
    fn wrap_entry_point(self: Box<Self>, mode: Arc<ExecutionMode>) -> Box<dyn FnOnce() + Send>;
}

impl<F> Resumable for F
where
    F: FnOnce() + Send + 'static,
{
    fn wrap_entry_point(self: Box<Self>, mode: Arc<ExecutionMode>) -> Box<dyn FnOnce() + Send> {
        Box::new(move || {
            let _scope = with_mode(mode);
            (*self)()
        })
    }
}

/// Host name used in phantom thread node names.
pub fn host_identifier() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("host-{}", std::process::id()))
}
