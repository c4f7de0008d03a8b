//! Reconnect backoff.
//!
//! Delay for attempt `n` is `floor * 2^n`, capped at `ceiling`. Both the
//! attempt count and "now" are inputs so the schedule is testable without
//! a runtime.

use std::time::Duration;
use tokio::time::Instant;

/// Default initial reconnect delay.
pub const DEFAULT_BACKOFF_FLOOR: Duration = Duration::from_millis(3000);

/// Default maximum reconnect delay.
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_FLOOR, DEFAULT_BACKOFF_CEILING)
    }
}

impl Backoff {
    /// A ceiling below the floor is raised to the floor.
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling: ceiling.max(floor),
        }
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Delay before re-allocating after `attempt` consecutive failed
    /// reconnects (0 for the first failure after an `Open`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.floor.checked_mul(factor))
            .map_or(self.ceiling, |delay| delay.min(self.ceiling))
    }

    /// Instant at which the reconnect for `attempt` should fire.
    pub fn deadline(&self, now: Instant, attempt: u32) -> Instant {
        now + self.delay_for_attempt(attempt)
    }
}
