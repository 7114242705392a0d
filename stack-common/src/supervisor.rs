//! Generic supervision loop: launch a service, watch its health, relaunch it
//! according to its restart policy.
//!
//! A [`Supervisor`] is parameterized by
//!   - a health predicate: an optional probe plus the health check defining
//!     its cadence and failure budget,
//!   - a backoff schedule for relaunches,
//!   - a restart action: the launcher and what it launches,
//!   - the restart policy deciding whether a relaunch happens at all.
//!
//! Every state change is published on a watch channel so that dependents and
//! status endpoints observe it without polling the supervisor.
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::health_check::{HealthTracker, HealthVerdict};
use crate::launcher::{LaunchSpec, Launcher, Process};
use crate::probe::{check_with_timeout, Probe};
use crate::retry::RetryPolicy;
use crate::spec::{HealthCheckSpec, RestartPolicy};

/// Used to cap relaunch delays of services without a health check.
pub const DEFAULT_RESTART_CAP: Duration = Duration::from_secs(10);
const INITIAL_RESTART_DELAY: Duration = Duration::from_millis(100);

/// `pending → starting → running → {healthy, unhealthy} → (restart → starting) | stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Pending,
    Starting,
    Running,
    Healthy,
    Unhealthy,
    Stopped,
}

impl ServiceState {
    /// Start-order dependencies are satisfied by any state past `pending`.
    pub fn has_started(&self) -> bool {
        !matches!(self, ServiceState::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    pub restarts: u32,
    pub pid: Option<u32>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub launched_at: Option<OffsetDateTime>,
    pub last_exit_code: Option<i32>,
    pub consecutive_failures: u32,
    pub last_probe_error: Option<String>,
}

impl ServiceStatus {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            state: ServiceState::Pending,
            restarts: 0,
            pid: None,
            launched_at: None,
            last_exit_code: None,
            consecutive_failures: 0,
            last_probe_error: None,
        }
    }
}

/// Why a launched instance is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(Option<i32>),
    Unhealthy,
    LaunchFailed,
    /// The operator asked for the service to stop.
    Stopped,
}

impl RestartPolicy {
    pub fn allows_restart(&self, termination: &Termination) -> bool {
        match (self, termination) {
            (_, Termination::Stopped) => false,
            (RestartPolicy::No, _) => false,
            (RestartPolicy::OnFailure, Termination::Exited(Some(0))) => false,
            (RestartPolicy::OnFailure, _) => true,
            (RestartPolicy::Always | RestartPolicy::UnlessStopped, _) => true,
        }
    }
}

#[derive(Clone)]
pub struct HealthGate {
    pub probe: Arc<dyn Probe>,
    pub spec: HealthCheckSpec,
}

pub struct Supervisor {
    name: String,
    image: Option<String>,
    launch: LaunchSpec,
    launcher: Arc<dyn Launcher>,
    health: Option<HealthGate>,
    restart_policy: RestartPolicy,
    backoff: RetryPolicy,
    stop_grace_period: Duration,
    status: watch::Sender<ServiceStatus>,
}

impl Supervisor {
    pub fn new(name: &str, launcher: Arc<dyn Launcher>, launch: LaunchSpec) -> Self {
        let (status, _) = watch::channel(ServiceStatus::pending(name));
        Self {
            name: name.to_owned(),
            image: None,
            launch,
            launcher,
            health: None,
            restart_policy: RestartPolicy::default(),
            backoff: restart_backoff(None),
            stop_grace_period: Duration::from_secs(10),
            status,
        }
    }

    /// Also caps the relaunch delay at one probe interval, unless a backoff is
    /// set explicitly afterwards.
    pub fn with_health_check(mut self, probe: Arc<dyn Probe>, spec: HealthCheckSpec) -> Self {
        self.backoff = restart_backoff(Some(&spec));
        self.health = Some(HealthGate { probe, spec });
        self
    }

    /// Informational only: logged at every launch.
    pub fn with_image(mut self, image: Option<String>) -> Self {
        self.image = image;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.status.subscribe()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_health_check(&self) -> bool {
        self.health.is_some()
    }

    /// Supervise until the token is cancelled or the restart policy gives
    /// up. Returns the final status, always in the `stopped` state.
    pub async fn run(self, cancel: CancellationToken) -> ServiceStatus {
        let mut backoff_attempt = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.status.send_modify(|status| {
                status.state = ServiceState::Starting;
                status.launched_at = Some(OffsetDateTime::now_utc());
                status.consecutive_failures = 0;
                status.last_probe_error = None;
            });
            info!(
                service = %self.name,
                image = self.image.as_deref().unwrap_or("-"),
                program = %self.launch.program,
                "starting service"
            );

            let termination = match self.launcher.launch(&self.launch).await {
                Ok(mut process) => {
                    let pid = process.id();
                    self.status.send_modify(|status| {
                        status.state = ServiceState::Running;
                        status.pid = pid;
                    });
                    info!(service = %self.name, pid = ?pid, "service running");
                    self.supervise(process.as_mut(), &cancel, &mut backoff_attempt)
                        .await
                }
                Err(error) => {
                    error!(service = %self.name, %error, "failed to launch service");
                    Termination::LaunchFailed
                }
            };
            self.status.send_modify(|status| status.pid = None);

            if termination == Termination::Stopped {
                break;
            }

            self.status
                .send_modify(|status| status.state = ServiceState::Unhealthy);
            metrics::gauge!("service_healthy", "service" => self.name.clone()).set(0.0);

            if !self.restart_policy.allows_restart(&termination) {
                info!(
                    service = %self.name,
                    policy = %self.restart_policy,
                    ?termination,
                    "restart policy does not allow a relaunch"
                );
                break;
            }

            backoff_attempt += 1;
            let delay = self.backoff.retry_interval(backoff_attempt);
            warn!(service = %self.name, ?termination, ?delay, "relaunching service");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            self.status.send_modify(|status| status.restarts += 1);
            metrics::counter!("service_restarts_total", "service" => self.name.clone())
                .increment(1);
        }

        self.status
            .send_modify(|status| status.state = ServiceState::Stopped);
        info!(service = %self.name, "service stopped");
        self.status.borrow().clone()
    }

    async fn supervise(
        &self,
        process: &mut dyn Process,
        cancel: &CancellationToken,
        backoff_attempt: &mut u32,
    ) -> Termination {
        let mut tracker = self
            .health
            .as_ref()
            .map(|gate| HealthTracker::new(&gate.spec, Instant::now()));
        let interval = self
            .health
            .as_ref()
            .map(|gate| gate.spec.interval())
            .unwrap_or(DEFAULT_RESTART_CAP);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(service = %self.name, "stopping service");
                    let code = process.terminate(self.stop_grace_period).await;
                    self.status.send_modify(|status| status.last_exit_code = code);
                    return Termination::Stopped;
                }
                code = process.wait() => {
                    warn!(service = %self.name, ?code, "service exited");
                    self.status.send_modify(|status| status.last_exit_code = code);
                    return Termination::Exited(code);
                }
                _ = ticker.tick(), if tracker.is_some() => {
                    let (Some(gate), Some(tracker)) = (self.health.as_ref(), tracker.as_mut()) else {
                        continue;
                    };
                    match self.probe_once(gate, tracker).await {
                        HealthVerdict::Healthy => *backoff_attempt = 0,
                        HealthVerdict::Starting => {}
                        HealthVerdict::Unhealthy => {
                            warn!(
                                service = %self.name,
                                failures = tracker.consecutive_failures(),
                                "health check budget exhausted, service is unhealthy"
                            );
                            let code = process.terminate(self.stop_grace_period).await;
                            self.status.send_modify(|status| status.last_exit_code = code);
                            return Termination::Unhealthy;
                        }
                    }
                }
            }
        }
    }

    async fn probe_once(&self, gate: &HealthGate, tracker: &mut HealthTracker) -> HealthVerdict {
        let outcome = check_with_timeout(gate.probe.as_ref(), gate.spec.timeout()).await;
        let verdict = tracker.observe(outcome.is_ok(), Instant::now());

        let label = match outcome {
            Ok(_) => "success",
            Err(_) => "failure",
        };
        metrics::counter!(
            "health_probe_total",
            "service" => self.name.clone(),
            "outcome" => label
        )
        .increment(1);

        if let Err(error) = &outcome {
            warn!(
                service = %self.name,
                probe = %gate.probe.describe(),
                %error,
                grace = tracker.in_grace_period(Instant::now()),
                "health probe failed"
            );
        }

        let failures = tracker.consecutive_failures();
        let probe_error = outcome.err().map(|error| error.to_string());
        self.status.send_modify(|status| {
            status.consecutive_failures = failures;
            status.last_probe_error = probe_error;
            if verdict == HealthVerdict::Healthy {
                status.state = ServiceState::Healthy;
            }
        });
        if verdict == HealthVerdict::Healthy {
            metrics::gauge!("service_healthy", "service" => self.name.clone()).set(1.0);
        }

        verdict
    }
}

/// 100ms doubling per consecutive relaunch, capped at one probe interval so a
/// service declared unhealthy is relaunched within one polling interval.
pub fn restart_backoff(health: Option<&HealthCheckSpec>) -> RetryPolicy {
    let cap = health
        .map(|spec| spec.interval())
        .unwrap_or(DEFAULT_RESTART_CAP);
    RetryPolicy::exponential(INITIAL_RESTART_DELAY).capped_at(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_policies() {
        let crash = Termination::Exited(Some(1));
        let clean = Termination::Exited(Some(0));
        let signal = Termination::Exited(None);

        assert!(!RestartPolicy::No.allows_restart(&crash));
        assert!(!RestartPolicy::No.allows_restart(&Termination::Unhealthy));

        assert!(RestartPolicy::OnFailure.allows_restart(&crash));
        assert!(RestartPolicy::OnFailure.allows_restart(&signal));
        assert!(RestartPolicy::OnFailure.allows_restart(&Termination::Unhealthy));
        assert!(RestartPolicy::OnFailure.allows_restart(&Termination::LaunchFailed));
        assert!(!RestartPolicy::OnFailure.allows_restart(&clean));

        for policy in [RestartPolicy::Always, RestartPolicy::UnlessStopped] {
            assert!(policy.allows_restart(&crash));
            assert!(policy.allows_restart(&clean));
            assert!(policy.allows_restart(&Termination::Unhealthy));
            assert!(!policy.allows_restart(&Termination::Stopped));
        }
    }

    #[test]
    fn restart_delay_is_capped_by_probe_interval() {
        let check = HealthCheckSpec::new(crate::spec::ProbeSpec::Tcp {
            address: "127.0.0.1:1".to_owned(),
        })
        .with_interval(Duration::from_secs(1));
        let backoff = restart_backoff(Some(&check));

        assert_eq!(backoff.retry_interval(1), Duration::from_millis(100));
        assert_eq!(backoff.retry_interval(2), Duration::from_millis(200));
        assert_eq!(backoff.retry_interval(10), Duration::from_secs(1));
    }

    #[test]
    fn pending_is_the_only_unstarted_state() {
        assert!(!ServiceState::Pending.has_started());
        for state in [
            ServiceState::Starting,
            ServiceState::Running,
            ServiceState::Healthy,
            ServiceState::Unhealthy,
            ServiceState::Stopped,
        ] {
            assert!(state.has_started());
        }
    }
}
