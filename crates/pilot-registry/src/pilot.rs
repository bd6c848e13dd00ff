//! Per-pilot lifecycle.

use std::fmt;

/// Where a pilot is in its lifecycle on this host.
///
/// ```text
/// Allocated ──threads > 0──▶ Running ──threads == 0──▶ Draining ──▶ Cleaned
///                               ▲                          │
///                               └──────threads > 0─────────┘
/// ```
///
/// Any state goes straight to `Cleaned` when the pilot node is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PilotState {
    Allocated,
    Running,
    Draining,
    Cleaned,
}

impl PilotState {
    pub fn is_terminal(self) -> bool {
        self == PilotState::Cleaned
    }

    /// Next state given how many phantom threads are currently running.
    pub fn with_threads(self, running: usize) -> Self {
        match self {
            PilotState::Cleaned => PilotState::Cleaned,
            _ if running > 0 => PilotState::Running,
            PilotState::Allocated => PilotState::Allocated,
            PilotState::Running | PilotState::Draining => PilotState::Draining,
        }
    }
}

impl fmt::Display for PilotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PilotState::Allocated => "allocated",
            PilotState::Running => "running",
            PilotState::Draining => "draining",
            PilotState::Cleaned => "cleaned",
        };
        f.write_str(s)
    }
}

/// Terminal outcome reported by `wait_until_pilot_finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PilotStatus {
    Success,
    /// A result node was recorded for the pilot.
    Failure,
    Timeout,
}

impl fmt::Display for PilotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PilotStatus::Success => "success",
            PilotStatus::Failure => "failure",
            PilotStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let state = PilotState::Allocated;
        assert_eq!(state.with_threads(0), PilotState::Allocated);
        let state = state.with_threads(2);
        assert_eq!(state, PilotState::Running);
        let state = state.with_threads(0);
        assert_eq!(state, PilotState::Draining);
        assert_eq!(state.with_threads(1), PilotState::Running);
    }

    #[test]
    fn test_cleaned_is_terminal() {
        assert!(PilotState::Cleaned.is_terminal());
        assert_eq!(PilotState::Cleaned.with_threads(3), PilotState::Cleaned);
        assert!(!PilotState::Draining.is_terminal());
    }
}
