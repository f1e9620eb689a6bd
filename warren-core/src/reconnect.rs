//! Reconnection state with a bounded exponential backoff.
//!
//! One `ReconnectState` tracks a single outage: it hands out delays until
//! the retry budget is spent, then reports exhaustion. A successful
//! reconnect resets it for the next outage.

use crate::options::BackoffOptions;
use std::time::Duration;

/// Reconnection state tracker for managing attempts and backoff.
///
/// # Example
///
/// ```rust
/// use warren_core::options::BackoffOptions;
/// use warren_core::reconnect::ReconnectState;
/// use std::time::Duration;
///
/// let backoff = BackoffOptions::default()
///     .with_retries(3)
///     .with_min_delay(Duration::from_millis(100))
///     .with_max_delay(Duration::from_secs(10));
///
/// let mut reconnect = ReconnectState::new(backoff);
///
/// assert_eq!(reconnect.next_delay(), Some(Duration::from_millis(100)));
/// assert_eq!(reconnect.next_delay(), Some(Duration::from_millis(200)));
/// assert_eq!(reconnect.next_delay(), Some(Duration::from_millis(400)));
///
/// // Budget spent
/// assert_eq!(reconnect.next_delay(), None);
///
/// // Reset on successful connection
/// reconnect.reset();
/// assert_eq!(reconnect.next_delay(), Some(Duration::from_millis(100)));
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectState {
    backoff: BackoffOptions,
    /// Attempts handed out in the current outage
    attempt: u32,
}

impl ReconnectState {
    /// Create a new reconnection state tracker.
    pub const fn new(backoff: BackoffOptions) -> Self {
        Self { backoff, attempt: 0 }
    }

    /// Get the delay before the next attempt, or `None` once the retry
    /// budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.backoff.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Reset the state after a successful reconnection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Whether every attempt of the budget has been handed out.
    #[inline]
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.attempt >= self.backoff.retries
    }

    /// Get the current attempt number.
    #[inline]
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Get the configured retry budget.
    #[inline]
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.backoff.retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(retries: u32, min_ms: u64, max_ms: u64) -> BackoffOptions {
        BackoffOptions::default()
            .with_retries(retries)
            .with_min_delay(Duration::from_millis(min_ms))
            .with_max_delay(Duration::from_millis(max_ms))
    }

    #[test]
    fn test_exponential_backoff() {
        let mut state = ReconnectState::new(backoff(10, 100, 10_000));

        assert_eq!(state.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(state.attempt(), 1);
        assert_eq!(state.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(state.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(state.next_delay(), Some(Duration::from_millis(800)));
        assert_eq!(state.attempt(), 4);
    }

    #[test]
    fn test_max_delay_cap() {
        let mut state = ReconnectState::new(backoff(10, 100, 500));

        assert_eq!(state.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(state.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(state.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(state.next_delay(), Some(Duration::from_millis(500)));
        assert_eq!(state.next_delay(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut state = ReconnectState::new(backoff(2, 10, 100));

        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_some());
        assert!(state.is_exhausted());
        assert_eq!(state.next_delay(), None);
        assert_eq!(state.attempt(), 2);
    }

    #[test]
    fn test_zero_retries_never_retries() {
        let mut state = ReconnectState::new(backoff(0, 10, 100));
        assert!(state.is_exhausted());
        assert_eq!(state.next_delay(), None);
    }

    #[test]
    fn test_reset() {
        let mut state = ReconnectState::new(backoff(3, 100, 10_000));
        state.next_delay();
        state.next_delay();
        state.next_delay();
        assert!(state.is_exhausted());

        state.reset();
        assert_eq!(state.attempt(), 0);
        assert_eq!(state.next_delay(), Some(Duration::from_millis(100)));
    }
}
