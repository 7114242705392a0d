use tokio::time::{Duration, Instant};

use crate::spec::HealthCheckSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// No probe succeeded yet and the failure budget is not spent.
    Starting,
    Healthy,
    Unhealthy,
}

/// Turns a stream of timed probe outcomes into a verdict.
///
/// Failures observed before the end of the start period are ignored, unless a
/// probe already succeeded: the first success ends the grace period early.
/// Outside the grace period, `retries` consecutive failures make the target
/// unhealthy; any success makes it healthy again and resets the count.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    retries: u32,
    grace_until: Option<Instant>,
    consecutive_failures: u32,
    verdict: HealthVerdict,
}

impl HealthTracker {
    pub fn new(spec: &HealthCheckSpec, started_at: Instant) -> Self {
        Self::with_budget(spec.retries(), spec.start_period(), started_at)
    }

    pub fn with_budget(retries: u32, start_period: Duration, started_at: Instant) -> Self {
        Self {
            retries: retries.max(1),
            grace_until: Some(started_at + start_period),
            consecutive_failures: 0,
            verdict: HealthVerdict::Starting,
        }
    }

    pub fn observe(&mut self, success: bool, at: Instant) -> HealthVerdict {
        if success {
            self.grace_until = None;
            self.consecutive_failures = 0;
            self.verdict = HealthVerdict::Healthy;
            return self.verdict;
        }

        if let Some(grace_until) = self.grace_until {
            if at < grace_until {
                return self.verdict;
            }
            self.grace_until = None;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.retries {
            self.verdict = HealthVerdict::Unhealthy;
        }
        self.verdict
    }

    pub fn verdict(&self) -> HealthVerdict {
        self.verdict
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn in_grace_period(&self, at: Instant) -> bool {
        self.grace_until.is_some_and(|until| at < until)
    }
}
