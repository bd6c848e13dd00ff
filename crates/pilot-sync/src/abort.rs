//! Abort signalling from lock wrappers to whoever owns the pilots.
//!
//! Locks never call into the registry directly. They push an
//! [`AbortRequest`] down a channel and keep going; the receiving side
//! decides which phantom threads to interrupt.

use crossbeam_channel::{unbounded, Receiver, Sender};
use pilot_config::log_lock_debug;
use pilot_context::PilotId;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// A live acquisition found shadow tickets still outstanding.
    OrderingViolation { lock: String },
    /// A shadow signal popped a live waiter.
    Divergence { condition: String },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::OrderingViolation { lock } => write!(f, "ordering violation on {lock}"),
            AbortReason::Divergence { condition } => write!(f, "divergence on {condition}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortRequest {
    /// `None` when the offending pilot could not be determined.
    pub pilot: Option<PilotId>,
    pub reason: AbortReason,
}

/// Sending half of the abort channel. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    sender: Option<Sender<AbortRequest>>,
}

impl AbortHandle {
    pub fn channel() -> (Self, Receiver<AbortRequest>) {
        let (tx, rx) = unbounded();
        (Self { sender: Some(tx) }, rx)
    }

    /// A handle that drops every request.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Returns `false` if nobody is listening.
    pub fn request(&self, request: AbortRequest) -> bool {
        let Some(sender) = &self.sender else {
            log_lock_debug!("Abort request dropped (no listener)", reason = %request.reason);
            return false;
        };
        match sender.send(request) {
            Ok(()) => true,
            Err(err) => {
                log_lock_debug!("Abort request dropped (receiver gone)", reason = %err.0.reason);
                false
            }
        }
    }
}

impl From<Sender<AbortRequest>> for AbortHandle {
    fn from(sender: Sender<AbortRequest>) -> Self {
        Self {
            sender: Some(sender),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_delivers() {
        let (handle, rx) = AbortHandle::channel();
        let request = AbortRequest {
            pilot: Some(PilotId(7)),
            reason: AbortReason::OrderingViolation {
                lock: "queue".into(),
            },
        };
        assert!(handle.request(request.clone()));
        assert_eq!(rx.try_recv().unwrap(), request);
    }

    #[test]
    fn test_disabled_and_disconnected() {
        let request = AbortRequest {
            pilot: None,
            reason: AbortReason::Divergence {
                condition: "not-empty".into(),
            },
        };
        assert!(!AbortHandle::disabled().request(request.clone()));

        let (handle, rx) = AbortHandle::channel();
        drop(rx);
        assert!(!handle.request(request));
    }
}
