//! Retry scheduling for failed remote writes.
//!
//! Backoff is quadratic in the number of consecutive failures and capped at
//! a ceiling. Once the ceiling is reached the failure counter stops growing,
//! so a long outage cannot push `retries` towards overflow.
//!
//! Formula: min(max_interval, retries² × base_delay), unless the remote
//! supplied an explicit retry-after hint.

use std::time::Duration;

/// Default ceiling for a single backoff delay (1 hour).
pub const DEFAULT_MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default unit multiplied by `retries²`.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay unit, multiplied by the square of the failure count.
    pub base_delay: Duration,
    /// Upper bound for any computed delay.
    pub max_interval: Duration,
}

/// The outcome of scheduling one retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    /// New consecutive-failure count.
    pub retries: u32,
    /// Delay until the next attempt.
    pub delay: Duration,
    /// Unix time after which the next attempt may run.
    pub retry_after: u64,
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(base_delay: Duration, max_interval: Duration) -> Self {
        Self {
            base_delay,
            max_interval,
        }
    }

    /// Uncapped delay for the given failure count.
    fn backoff(&self, retries: u32) -> Duration {
        self.base_delay
            .saturating_mul(retries.saturating_mul(retries))
    }

    /// Schedule the next attempt after a failure.
    ///
    /// `previous_retries` is the failure count before this failure; `hint` is
    /// a retry-after delay supplied by the remote, which takes precedence
    /// over the computed backoff.
    pub fn schedule(&self, previous_retries: u32, hint: Option<Duration>, now: u64) -> RetrySchedule {
        let capped = previous_retries > 0 && self.backoff(previous_retries) >= self.max_interval;
        let retries = if capped {
            previous_retries
        } else {
            previous_retries.saturating_add(1)
        };
        let delay = hint.unwrap_or_else(|| self.backoff(retries).min(self.max_interval));
        RetrySchedule {
            retries,
            delay,
            retry_after: now.saturating_add(ceil_secs(delay)),
        }
    }

    /// Schedule an attempt as far out as the policy allows.
    ///
    /// Used for objects that cannot currently be encoded for upload.
    pub fn defer(&self, retries: u32, now: u64) -> RetrySchedule {
        RetrySchedule {
            retries,
            delay: self.max_interval,
            retry_after: now.saturating_add(ceil_secs(self.max_interval)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_BASE_DELAY, DEFAULT_MAX_RETRY_INTERVAL)
    }
}

fn ceil_secs(delay: Duration) -> u64 {
    delay.as_secs() + u64::from(delay.subsec_nanos() > 0)
}
