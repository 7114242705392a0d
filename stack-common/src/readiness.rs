//! Waiting for a dependency before doing work that needs it.
use std::fmt::Display;
use std::future::Future;

use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::health_check::{HealthTracker, HealthVerdict};
use crate::probe::{check_with_timeout, Probe};
use crate::retry::RetryPolicy;
use crate::spec::HealthCheckSpec;

#[derive(Error, Debug)]
pub enum ReadinessError {
    #[error("{target} is unhealthy after {attempts} probes: {last_error}")]
    Unhealthy {
        target: String,
        attempts: u32,
        last_error: String,
    },
}

/// Probe `probe` on the cadence of `spec` until it succeeds once, or until the
/// health check declares it unhealthy. Returns the number of probes run.
///
/// The first probe runs immediately, so a target that is already up is
/// reported ready without waiting one interval.
pub async fn wait_healthy(
    probe: &dyn Probe,
    spec: &HealthCheckSpec,
) -> Result<u32, ReadinessError> {
    let mut tracker = HealthTracker::new(spec, Instant::now());
    let mut ticker = tokio::time::interval(spec.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts = 0;

    loop {
        ticker.tick().await;
        attempts += 1;

        let outcome = check_with_timeout(probe, spec.timeout()).await;
        let verdict = tracker.observe(outcome.is_ok(), Instant::now());
        match (verdict, outcome) {
            (HealthVerdict::Healthy, _) => {
                info!(probe = %probe.describe(), attempts, "target is ready");
                return Ok(attempts);
            }
            (HealthVerdict::Unhealthy, Err(error)) => {
                return Err(ReadinessError::Unhealthy {
                    target: probe.describe(),
                    attempts,
                    last_error: error.to_string(),
                });
            }
            (_, Err(error)) => {
                debug!(
                    probe = %probe.describe(),
                    attempts,
                    failures = tracker.consecutive_failures(),
                    %error,
                    "target is not ready yet"
                );
            }
            (_, Ok(())) => {}
        }
    }
}

/// Run `op` until it succeeds or `max_attempts` attempts failed, sleeping
/// `policy.retry_interval(attempt)` between attempts. `op` receives the
/// 1-based attempt number. The last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(
    what: &str,
    policy: &RetryPolicy,
    max_attempts: u32,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt >= max_attempts => {
                warn!(what, attempt, %error, "giving up");
                return Err(error);
            }
            Err(error) => {
                let delay = policy.retry_interval(attempt);
                warn!(what, attempt, max_attempts, ?delay, %error, "attempt failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
