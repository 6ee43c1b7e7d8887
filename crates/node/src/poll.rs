//! Delay between poll iterations.
//!
//! The node sleeps [`PollPolicy::interval`] after every idle or clean
//! iteration. After a failed iteration the delay grows by
//! [`PollPolicy::multiplier`] up to [`PollPolicy::max_delay`]; with the
//! default multiplier of `1.0` the cadence stays fixed.

use std::time::Duration;

/// Default delay between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default upper bound on the failure backoff.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Tunable parameters for the poll cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// Delay after an idle or successful iteration, and the first delay
    /// after a failure.
    pub interval: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each consecutive failure.
    pub multiplier: f64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: 1.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and policy.
///
/// The result is clamped to `[interval, max_delay]`.
pub fn next_delay(current: Duration, policy: &PollPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms)
        .min(policy.max_delay)
        .max(policy.interval)
}

/// Tracks consecutive failures and hands out the delay before the next poll.
#[derive(Debug)]
pub struct Backoff {
    policy: PollPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: PollPolicy) -> Self {
        let current = policy.interval;
        Self { policy, current }
    }

    /// Delay after an idle or successful iteration. Resets the backoff.
    pub fn on_success(&mut self) -> Duration {
        self.current = self.policy.interval;
        self.current
    }

    /// Delay after a failed iteration. Grows the next failure delay.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current;
        self.current = next_delay(delay, &self.policy);
        delay
    }
}
