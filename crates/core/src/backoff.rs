//! Capped exponential backoff shared by the reflector and the work queue.

#![forbid(unsafe_code)]

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max: max.max(min), attempts: 0 }
    }

    /// Delay for the n-th consecutive failure (1-based): `min * 2^(n-1)`, capped at `max`.
    pub fn delay_for(min: Duration, max: Duration, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(31);
        let factor = 1u32 << shift;
        min.checked_mul(factor).unwrap_or(max).min(max)
    }

    /// Record one failure and return how long to wait before the next try.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        Self::delay_for(self.min, self.max, self.attempts)
    }

    pub fn reset(&mut self) { self.attempts = 0; }

    pub fn attempts(&self) -> u32 { self.attempts }

    pub fn min(&self) -> Duration { self.min }

    pub fn max(&self) -> Duration { self.max }
}
