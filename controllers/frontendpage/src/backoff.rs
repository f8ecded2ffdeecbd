//! # Exponential Backoff
//!
//! Backoff used for watch reconnects ([`ExponentialBackoff`]) and for
//! rate-limited requeues of failing work items ([`ItemRateLimiter`]).
//!
//! Delays double from `base` on every consecutive failure and are capped
//! at `max`: with the defaults (5ms, 1000s) the sequence is 5ms, 10ms,
//! 20ms, ... reaching the cap after roughly eighteen failures.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

/// Exponential backoff calculator
///
/// Stateful variant for a single retrying operation; reset it after a
/// success.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff starting at `base` and capped at `max`
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: 0 }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let delay = Self::for_failures(self.failures, self.base, self.max);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Calculate the delay after `failures` previous failures (stateless)
    ///
    /// `failures == 0` yields `base`; every further failure doubles it,
    /// capped at `max`.
    #[must_use]
    pub fn for_failures(failures: u32, base: Duration, max: Duration) -> Duration {
        // exponent clamped so the shift cannot overflow u32
        let factor = 2u32.checked_pow(failures.min(31)).unwrap_or(u32::MAX);
        base.checked_mul(factor).map_or(max, |d| d.min(max))
    }
}

/// Per-item exponential rate limiter
///
/// Tracks consecutive failures per key so that one persistently failing
/// object backs off without slowing down the others.
#[derive(Debug)]
pub struct ItemRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T: Eq + Hash + Clone> ItemRateLimiter<T> {
    /// Create a limiter starting at `base` and capped at `max`
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(HashMap::new()) }
    }

    /// Records a failure of `item` and returns how long to wait before retrying it
    pub fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let count = failures.entry(item.clone()).or_insert(0);
        let delay = ExponentialBackoff::for_failures(*count, self.base, self.max);
        *count = count.saturating_add(1);
        delay
    }

    /// Upper bound of any delay returned by [`Self::when`]
    pub fn max_delay(&self) -> Duration {
        self.max
    }

    /// Clears the failure history of `item`
    pub fn forget(&self, item: &T) {
        self.failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(item);
    }

    /// Number of consecutive failures recorded for `item`
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(item)
            .copied()
            .unwrap_or(0)
    }
}
