use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use stack_common::launcher::{LaunchError, LaunchSpec, Launcher, Process};
use stack_common::probe::{Probe, ProbeError};
use stack_common::spec::{HealthCheckSpec, ProbeSpec, RestartPolicy};
use stack_common::supervisor::{ServiceState, Supervisor};

#[derive(Clone, Copy)]
enum Behavior {
    RunForever,
    ExitAfter(Duration, Option<i32>),
    FailToLaunch,
}

#[derive(Default)]
struct Events {
    launches: Vec<Instant>,
    terminations: Vec<Instant>,
}

#[derive(Clone, Default)]
struct FakeLauncher {
    script: Arc<Mutex<VecDeque<Behavior>>>,
    events: Arc<Mutex<Events>>,
}

impl FakeLauncher {
    fn scripted(behaviors: &[Behavior]) -> Self {
        let launcher = FakeLauncher::default();
        launcher.script.lock().unwrap().extend(behaviors.iter().copied());
        launcher
    }

    fn launches(&self) -> Vec<Instant> {
        self.events.lock().unwrap().launches.clone()
    }

    fn terminations(&self) -> Vec<Instant> {
        self.events.lock().unwrap().terminations.clone()
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, _spec: &LaunchSpec) -> Result<Box<dyn Process>, LaunchError> {
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Behavior::RunForever);
        let now = Instant::now();
        self.events.lock().unwrap().launches.push(now);

        let exit_at = match behavior {
            Behavior::FailToLaunch => return Err(LaunchError::EmptyCommand),
            Behavior::RunForever => None,
            Behavior::ExitAfter(after, code) => Some((now + after, code)),
        };
        Ok(Box::new(FakeProcess {
            exit_at,
            events: self.events.clone(),
        }))
    }
}

struct FakeProcess {
    exit_at: Option<(Instant, Option<i32>)>,
    events: Arc<Mutex<Events>>,
}

#[async_trait]
impl Process for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    async fn wait(&mut self) -> Option<i32> {
        match self.exit_at {
            Some((deadline, code)) => {
                tokio::time::sleep_until(deadline).await;
                code
            }
            None => std::future::pending().await,
        }
    }

    async fn terminate(&mut self, _grace: Duration) -> Option<i32> {
        self.events.lock().unwrap().terminations.push(Instant::now());
        None
    }
}

#[derive(Clone, Default)]
struct SwitchProbe {
    healthy: Arc<AtomicBool>,
    checks: Arc<AtomicU32>,
}

impl SwitchProbe {
    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl Probe for SwitchProbe {
    async fn check(&self) -> Result<(), ProbeError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        match self.healthy.load(Ordering::SeqCst) {
            true => Ok(()),
            false => Err(ProbeError::UnexpectedStatus(503)),
        }
    }

    fn describe(&self) -> String {
        "switch".to_owned()
    }
}

fn check(interval_secs: u64, retries: u32, start_period_secs: u64) -> HealthCheckSpec {
    HealthCheckSpec::new(ProbeSpec::Tcp {
        address: "unused:0".to_owned(),
    })
    .with_interval(Duration::from_secs(interval_secs))
    .with_timeout(Duration::from_secs(5))
    .with_retries(retries)
    .with_start_period(Duration::from_secs(start_period_secs))
}

fn supervisor(launcher: &FakeLauncher) -> Supervisor {
    Supervisor::new(
        "database",
        Arc::new(launcher.clone()),
        LaunchSpec::from_argv(&["postgres".to_owned()]).unwrap(),
    )
}

#[tokio::test(start_paused = true)]
async fn failing_probe_marks_unhealthy_and_relaunches_within_one_interval() {
    let launcher = FakeLauncher::default();
    let probe = SwitchProbe::default();
    let spec = check(1, 10, 10);

    let supervisor = supervisor(&launcher)
        .with_health_check(Arc::new(probe.clone()), spec.clone())
        .with_restart_policy(RestartPolicy::UnlessStopped);
    let mut status = supervisor.subscribe();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(supervisor.run(cancel.clone()));

    status
        .wait_for(|status| status.restarts >= 1 && status.state == ServiceState::Running)
        .await
        .unwrap();

    let launches = launcher.launches();
    let terminations = launcher.terminations();
    assert_eq!(launches.len(), 2);
    assert_eq!(terminations.len(), 1);

    let unhealthy_after = terminations[0] - launches[0];
    assert!(unhealthy_after >= spec.start_period());
    assert!(unhealthy_after <= spec.unhealthy_after());
    assert!(launches[1] - terminations[0] <= spec.interval());

    cancel.cancel();
    let last = task.await.unwrap();
    assert_eq!(last.state, ServiceState::Stopped);
    assert_eq!(last.restarts, 1);
}

#[tokio::test(start_paused = true)]
async fn healthy_probe_reports_healthy_and_never_restarts() {
    let launcher = FakeLauncher::default();
    let probe = SwitchProbe::default();
    probe.set_healthy(true);

    let supervisor = supervisor(&launcher)
        .with_health_check(Arc::new(probe.clone()), check(10, 5, 20))
        .with_restart_policy(RestartPolicy::UnlessStopped);
    let mut status = supervisor.subscribe();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(supervisor.run(cancel.clone()));

    status
        .wait_for(|status| status.state == ServiceState::Healthy)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert!(probe.checks.load(Ordering::SeqCst) >= 10);
    assert_eq!(status.borrow().state, ServiceState::Healthy);
    assert_eq!(launcher.launches().len(), 1);

    cancel.cancel();
    let last = task.await.unwrap();
    assert_eq!(last.restarts, 0);
    assert_eq!(launcher.terminations().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn recovers_after_an_outage() {
    let launcher = FakeLauncher::default();
    let probe = SwitchProbe::default();
    probe.set_healthy(true);

    let supervisor = supervisor(&launcher)
        .with_health_check(Arc::new(probe.clone()), check(1, 3, 0))
        .with_restart_policy(RestartPolicy::UnlessStopped);
    let mut status = supervisor.subscribe();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(supervisor.run(cancel.clone()));

    status
        .wait_for(|status| status.state == ServiceState::Healthy)
        .await
        .unwrap();

    probe.set_healthy(false);
    status
        .wait_for(|status| status.state == ServiceState::Unhealthy)
        .await
        .unwrap();

    probe.set_healthy(true);
    status
        .wait_for(|status| status.restarts == 1 && status.state == ServiceState::Healthy)
        .await
        .unwrap();

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn crash_is_treated_as_unhealthy() {
    let launcher = FakeLauncher::scripted(&[
        Behavior::ExitAfter(Duration::from_secs(3), Some(1)),
        Behavior::ExitAfter(Duration::from_secs(3), Some(0)),
    ]);

    let supervisor = supervisor(&launcher).with_restart_policy(RestartPolicy::OnFailure);
    let cancel = CancellationToken::new();
    let last = supervisor.run(cancel).await;

    // the crash is relaunched, the clean exit is not
    assert_eq!(launcher.launches().len(), 2);
    assert_eq!(last.restarts, 1);
    assert_eq!(last.last_exit_code, Some(0));
    assert_eq!(last.state, ServiceState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn no_restart_policy_stops_after_first_failure() {
    let launcher =
        FakeLauncher::scripted(&[Behavior::ExitAfter(Duration::from_secs(1), Some(2))]);

    let supervisor = supervisor(&launcher);
    let mut status = supervisor.subscribe();
    let last = supervisor.run(CancellationToken::new()).await;

    assert_eq!(launcher.launches().len(), 1);
    assert_eq!(last.restarts, 0);
    assert_eq!(last.last_exit_code, Some(2));
    assert_eq!(status.borrow_and_update().state, ServiceState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn launch_failures_back_off() {
    let launcher = FakeLauncher::scripted(&[
        Behavior::FailToLaunch,
        Behavior::FailToLaunch,
        Behavior::FailToLaunch,
    ]);

    let supervisor = supervisor(&launcher).with_restart_policy(RestartPolicy::Always);
    let mut status = supervisor.subscribe();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(supervisor.run(cancel.clone()));

    status
        .wait_for(|status| status.state == ServiceState::Running)
        .await
        .unwrap();

    let launches = launcher.launches();
    assert_eq!(launches.len(), 4);
    let expected = [100, 200, 400].map(Duration::from_millis);
    for (window, expected) in launches.windows(2).zip(expected) {
        let gap = window[1] - window[0];
        assert!(
            gap >= expected && gap < expected + Duration::from_millis(5),
            "gap {gap:?}, expected {expected:?}"
        );
    }

    cancel.cancel();
    let last = task.await.unwrap();
    assert_eq!(last.restarts, 3);
}

#[tokio::test(start_paused = true)]
async fn cancellation_terminates_the_process() {
    let launcher = FakeLauncher::default();
    let supervisor = supervisor(&launcher).with_restart_policy(RestartPolicy::Always);
    let mut status = supervisor.subscribe();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(supervisor.run(cancel.clone()));

    status
        .wait_for(|status| status.state == ServiceState::Running)
        .await
        .unwrap();
    cancel.cancel();

    let last = task.await.unwrap();
    assert_eq!(last.state, ServiceState::Stopped);
    assert_eq!(last.restarts, 0);
    assert_eq!(launcher.terminations().len(), 1);
}
