//! Bounded exponential backoff for rate-limited remote calls

use serde::Deserialize;
use std::time::{Duration, Instant};

use crate::error::{InboxError, Result};

/// Longest single wait unless a policy says otherwise
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Overall time a retried call may take unless a policy says otherwise
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

/// Retry budget for one class of remote call
///
/// Only [`InboxError::RateLimited`] is retried. The delay before attempt `k`
/// (1-indexed, `k >= 2`) is `base_delay * 2^(k-2)`, unless the server sent a
/// retry-after hint, which is used instead. Either is capped at `max_delay`.
///
/// A run never sleeps past `deadline` (measured from the first attempt): when
/// the next wait would cross it, the run gives up with
/// [`InboxError::RetriesExhausted`] even if attempts remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub deadline: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: DEFAULT_MAX_DELAY,
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Budget for bulk scans: more attempts, longer delays
    pub fn for_listing() -> Self {
        Self::new(5, Duration::from_millis(1000))
            .with_max_delay(Duration::from_secs(8))
            .with_deadline(Duration::from_secs(20))
    }

    /// Budget for single value fetches and writes: tuned for latency
    pub fn for_fetch() -> Self {
        Self::new(3, Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_deadline(Duration::from_secs(5))
    }

    /// Computed delay before `attempt` (1-indexed); zero for the first attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Wait before `attempt`, honouring a server hint but never beyond `max_delay`
    pub fn delay_before(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        match hint {
            Some(hint) => hint.min(self.max_delay),
            None => self.backoff(attempt),
        }
    }

    /// Run `op` under this policy, sleeping on the current thread between attempts
    pub fn run<T>(&self, op: impl FnMut(u32) -> Result<T>) -> Result<T> {
        self.run_with_sleep(op, std::thread::sleep)
    }

    /// Run `op` under this policy with a custom sleep function.
    ///
    /// `op` receives the 1-indexed attempt number. Time spent counts both the
    /// wall clock and the total handed to `sleep`, whichever is larger.
    pub fn run_with_sleep<T>(
        &self,
        mut op: impl FnMut(u32) -> Result<T>,
        mut sleep: impl FnMut(Duration),
    ) -> Result<T> {
        let started = Instant::now();
        let mut slept = Duration::ZERO;
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Err(InboxError::RateLimited { retry_after }) => {
                    let delay = self.delay_before(attempt + 1, retry_after);
                    let exhausted = InboxError::RetriesExhausted {
                        attempts: attempt,
                        retry_after: Some(retry_after.unwrap_or(delay)),
                    };
                    if attempt >= self.max_attempts {
                        log::warn!("[RETRY] Giving up after {} rate-limited attempts", attempt);
                        return Err(exhausted);
                    }
                    let spent = started.elapsed().max(slept);
                    if spent.saturating_add(delay) > self.deadline {
                        log::warn!(
                            "[RETRY] Giving up after {} attempts, {:?} deadline reached",
                            attempt,
                            self.deadline
                        );
                        return Err(exhausted);
                    }

                    attempt += 1;
                    log::debug!(
                        "[RETRY] Rate limited, attempt {}/{} in {:?}",
                        attempt,
                        self.max_attempts,
                        delay
                    );
                    sleep(delay);
                    slept += delay;
                }
                other => return other,
            }
        }
    }
}

/// Serialized form of a [`RetryPolicy`]
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl From<RetrySettings> for RetryPolicy {
    fn from(s: RetrySettings) -> Self {
        let mut policy = RetryPolicy::new(s.max_attempts, Duration::from_millis(s.base_delay_ms));
        if let Some(ms) = s.max_delay_ms {
            policy = policy.with_max_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = s.deadline_ms {
            policy = policy.with_deadline(Duration::from_millis(ms));
        }
        policy
    }
}

/// Retry budgets per call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudgets {
    /// Listing keys or running list queries
    pub list: RetryPolicy,
    /// Fetching or writing a single value
    pub fetch: RetryPolicy,
}

impl Default for RetryBudgets {
    fn default() -> Self {
        Self {
            list: RetryPolicy::for_listing(),
            fetch: RetryPolicy::for_fetch(),
        }
    }
}
