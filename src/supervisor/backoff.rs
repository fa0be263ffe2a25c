//! Linear reconnect backoff.

use std::time::Duration;

/// Bounded linear backoff: `delay = min(attempt * base, cap)`, at most
/// `max_attempts` reconnects in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay added per attempt.
    pub base_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
    /// Consecutive transient closes tolerated before the session is terminated.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }

    /// Whether attempt number `attempt` is still within budget.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}
