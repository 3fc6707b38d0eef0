use std::time::Duration;

/// Ceiling for the poll backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Exponential backoff between failed polls.
///
/// The k-th consecutive failure (k from 0) waits `min(base * 2^k, max)`. Any
/// successful poll resets the wait to `base`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
            failures: 0,
        }
    }

    /// Record a transport failure and return how long to wait before the
    /// next poll.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
        self.failures = 0;
    }

    /// Wait the next failure would get.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }
}
