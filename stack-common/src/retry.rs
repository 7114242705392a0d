//! Exponential backoff shared by service relaunches and startup connection
//! attempts.
use std::time::Duration;

/// Waits `initial × coefficient^(n-1)` before retry `n`, never longer than
/// `maximum` when one is set. Growth saturates instead of overflowing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    initial: Duration,
    coefficient: u32,
    maximum: Option<Duration>,
}

impl RetryPolicy {
    /// Doubling delays starting at `initial`, without a cap.
    pub fn exponential(initial: Duration) -> Self {
        Self {
            initial,
            coefficient: 2,
            maximum: None,
        }
    }

    /// The same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self::exponential(delay).with_coefficient(1)
    }

    pub fn with_coefficient(mut self, coefficient: u32) -> Self {
        self.coefficient = coefficient;
        self
    }

    pub fn capped_at(mut self, maximum: Duration) -> Self {
        self.maximum = Some(maximum);
        self
    }

    /// Delay before retry number `attempt`, counting from 1.
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let delay = self
            .coefficient
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|growth| self.initial.checked_mul(growth))
            .unwrap_or(Duration::MAX);

        self.maximum.map_or(delay, |maximum| delay.min(maximum))
    }
}
