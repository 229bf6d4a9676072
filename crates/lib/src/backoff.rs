//! Reconnect delay: doubles per consecutive failure, capped, reset on a successful open.

use std::time::Duration;

pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(250);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl Backoff {
    /// A `max` below `min` is raised to `min`.
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay the next scheduled reconnect would use.
    pub fn current(&self) -> Duration {
        self.current.min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }

    /// Returns the delay for this reconnect and doubles the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current();
        self.current = self
            .current
            .saturating_mul(2)
            .clamp(self.min, self.max);
        delay
    }
}
