//! Back-off configuration for client reconnection.

use std::time::Duration;

/// Exponential back-off between reconnection attempts.
///
/// The first attempt waits `initial_delay`; each failure doubles the wait,
/// capped at `max_delay`. A successful connection resets the sequence.
///
/// # Default Values
/// - `initial_delay`: 10 milliseconds
/// - `max_delay`: 1 second
///
/// # Invariants
/// - `initial_delay` must not exceed `max_delay`
/// - `initial_delay` must be at least 1 millisecond
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay once retries have increased exponentially.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Clamp delays to sane bounds and ensure `initial_delay <= max_delay`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use hostwire::client::BackoffConfig;
    ///
    /// let cfg = BackoffConfig {
    ///     initial_delay: Duration::from_millis(5),
    ///     max_delay: Duration::from_millis(1),
    /// };
    ///
    /// let normalized = cfg.normalized();
    /// assert_eq!(normalized.initial_delay, Duration::from_millis(1));
    /// assert_eq!(normalized.max_delay, Duration::from_millis(5));
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.initial_delay = self.initial_delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay);
        }
        self
    }

    /// Delay to use after a failed attempt that waited `current`.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use hostwire::client::BackoffConfig;
    ///
    /// let cfg = BackoffConfig::default();
    /// assert_eq!(cfg.next_delay(Duration::from_millis(10)), Duration::from_millis(20));
    /// assert_eq!(cfg.next_delay(Duration::from_millis(900)), Duration::from_secs(1));
    /// ```
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration { current.saturating_mul(2).min(self.max_delay) }
}
