//! Spin-wait pacing for ticket loops.

use crossbeam::utils::Backoff;
use pilot_config::SpinConfig;
use std::thread;
use std::time::Duration;

/// How a waiting thread burns time between checks.
///
/// Waits start with [`Backoff`] (spin, then yield). Once the backoff is
/// exhausted and `park_after_snoozes` is set, each further step parks for
/// `park_for`, which also lets `PhantomThread::interrupt` cut the wait short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinPolicy {
    pub park_after_snoozes: bool,
    pub park_for: Duration,
}

impl Default for SpinPolicy {
    fn default() -> Self {
        Self::from(&SpinConfig::default())
    }
}

impl From<&SpinConfig> for SpinPolicy {
    fn from(config: &SpinConfig) -> Self {
        Self {
            park_after_snoozes: config.park_after_snoozes,
            park_for: Duration::from_micros(config.park_micros),
        }
    }
}

impl SpinPolicy {
    /// Pure yield loop, never parks.
    pub fn yielding() -> Self {
        Self {
            park_after_snoozes: false,
            park_for: Duration::ZERO,
        }
    }

    pub(crate) fn spinner(&self) -> Spinner {
        Spinner {
            backoff: Backoff::new(),
            policy: *self,
        }
    }
}

/// Per-wait state; not shared between threads.
pub(crate) struct Spinner {
    backoff: Backoff,
    policy: SpinPolicy,
}

impl Spinner {
    pub(crate) fn wait(&self) {
        if self.policy.park_after_snoozes && self.backoff.is_completed() {
            thread::park_timeout(self.policy.park_for);
        } else {
            self.backoff.snooze();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_policy_from_config() {
        let config = SpinConfig {
            park_after_snoozes: false,
            park_micros: 250,
        };
        let policy = SpinPolicy::from(&config);
        assert!(!policy.park_after_snoozes);
        assert_eq!(policy.park_for, Duration::from_micros(250));
    }

    #[test]
    fn test_spinner_eventually_parks_briefly() {
        let spinner = SpinPolicy {
            park_after_snoozes: true,
            park_for: Duration::from_millis(1),
        }
        .spinner();
        let started = Instant::now();
        for _ in 0..64 {
            spinner.wait();
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
