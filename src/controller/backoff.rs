//! # Exponential Backoff
//!
//! Per-key retry delays for transient reconcile failures.
//!
//! Each delay doubles the previous one, starting at `start` and capped at `max`.
//! The controller context keeps one instance per failing RootSync and drops it
//! once the RootSync reconciles successfully.
//!
//! ## Usage
//!
//! ```rust
//! use reconciler_manager::controller::backoff::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(2));
//! assert_eq!(backoff.next_backoff(), Duration::from_millis(500));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
//! ```

use std::time::Duration;

/// Exponential backoff calculator
///
/// Tracks the number of attempts so callers can tell how long a key has been
/// failing without keeping a separate counter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    start: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff starting at `start` and never exceeding `max`
    ///
    /// # Example
    ///
    /// ```
    /// use reconciler_manager::controller::backoff::ExponentialBackoff;
    /// use std::time::Duration;
    ///
    /// let backoff = ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(60));
    /// assert_eq!(backoff.attempts(), 0);
    /// ```
    #[must_use]
    pub fn new(start: Duration, max: Duration) -> Self {
        let start = start.min(max);
        Self {
            start,
            max,
            current: start,
            attempts: 0,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        result
    }

    /// Number of delays handed out since creation or the last reset
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset the backoff to the initial state
    ///
    /// # Example
    ///
    /// ```
    /// use reconciler_manager::controller::backoff::ExponentialBackoff;
    /// use std::time::Duration;
    ///
    /// let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));
    /// backoff.next_backoff();
    /// backoff.next_backoff();
    /// backoff.reset();
    /// assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
    /// ```
    pub fn reset(&mut self) {
        self.current = self.start;
        self.attempts = 0;
    }
}
