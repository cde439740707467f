//! # Retry Backoff
//!
//! Delay policies for retry loops that never give up (resource type
//! registration at startup).
//!
//! - `Fixed`: the same delay every attempt (default: 30s)
//! - `Fibonacci`: 1s, 1s, 2s, 3s, 5s, 8s, ... capped at a maximum

use std::time::Duration;

/// Default delay between resource type registration attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Fibonacci backoff calculator
///
/// Generates backoff durations following the Fibonacci sequence, in seconds.
/// Each backoff is the sum of the previous two backoffs.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Previous backoff value in seconds
    prev_seconds: u64,
    /// Current backoff value in seconds
    current_seconds: u64,
    /// Maximum backoff value in seconds
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with specified minimum and maximum values in seconds
    ///
    /// # Arguments
    ///
    /// * `min_seconds` - Minimum backoff (used for the first two values)
    /// * `max_seconds` - Maximum backoff (caps the sequence)
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_seconds;

        let next = self.prev_seconds.saturating_add(self.current_seconds);
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);

        Duration::from_secs(result)
    }
}

/// How long to wait before the next retry.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Same delay for every attempt
    Fixed(Duration),
    /// Growing delay, capped
    Fibonacci(FibonacciBackoff),
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Fixed(DEFAULT_RETRY_DELAY)
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt; advances stateful policies.
    pub fn next_delay(&mut self) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Fibonacci(backoff) => backoff.next_backoff(),
        }
    }
}
