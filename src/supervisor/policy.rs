use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Bounded restart policy: exponential backoff with a cap, and at most
/// `max_restarts` restarts inside a sliding `window`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_restarts: usize,
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_restarts: 5,
            window: Duration::from_secs(300),
        }
    }
}

impl RestartPolicy {
    /// Delay before the restart following the `crashes`-th crash in the window.
    pub fn backoff(&self, crashes: usize) -> Duration {
        let exponent = crashes.saturating_sub(1).min(31) as u32;
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrashDecision {
    RestartAfter(Duration),
    GiveUp { crashes: usize },
}

/// Crash timestamps inside the sliding window.
#[derive(Clone, Debug, Default)]
pub struct CrashWindow {
    crashes: VecDeque<Instant>,
}

impl CrashWindow {
    pub fn record(&mut self, policy: &RestartPolicy, now: Instant) -> CrashDecision {
        self.prune(policy, now);
        self.crashes.push_back(now);
        let count = self.crashes.len();
        if count > policy.max_restarts {
            CrashDecision::GiveUp { crashes: count }
        } else {
            CrashDecision::RestartAfter(policy.backoff(count))
        }
    }

    pub fn in_window(&mut self, policy: &RestartPolicy, now: Instant) -> usize {
        self.prune(policy, now);
        self.crashes.len()
    }

    pub fn clear(&mut self) {
        self.crashes.clear();
    }

    fn prune(&mut self, policy: &RestartPolicy, now: Instant) {
        while let Some(oldest) = self.crashes.front() {
            if now.duration_since(*oldest) > policy.window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
    }
}
