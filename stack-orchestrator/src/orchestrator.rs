//! Runs a [`Deployment`]: one supervised task per service, started in
//! dependency order and stopped in reverse order.
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stack_common::launcher::{LaunchError, LaunchSpec, Launcher};
use stack_common::probe::{probe_for, ProbeError};
use stack_common::spec::ServiceSpec;
use stack_common::supervisor::{ServiceState, ServiceStatus, Supervisor};

use crate::descriptor::Deployment;
use crate::volume::{VolumeError, VolumeStore};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error("service {service}: {source}")]
    Launch {
        service: String,
        #[source]
        source: LaunchError,
    },
    #[error("service {service}: {source}")]
    Probe {
        service: String,
        #[source]
        source: ProbeError,
    },
}

pub struct Orchestrator {
    deployment: Deployment,
    volumes: VolumeStore,
    launcher: Arc<dyn Launcher>,
}

impl Orchestrator {
    pub fn new(deployment: Deployment, volumes: VolumeStore, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            deployment,
            volumes,
            launcher,
        }
    }

    /// Prepare every service, then spawn their supervisors. Nothing is
    /// launched if any volume or probe cannot be prepared.
    ///
    /// A service leaves `pending` once all of its dependencies have left
    /// `pending`: dependencies order the starts, they do not wait for
    /// readiness.
    pub async fn start(self) -> Result<RunningDeployment, OrchestratorError> {
        let mut supervisors = Vec::new();
        for service in self.deployment.services_in_start_order() {
            supervisors.push(self.supervisor(service).await?);
        }

        let board = StatusBoard::new(
            supervisors
                .iter()
                .map(|supervisor| BoardEntry {
                    name: supervisor.name().to_owned(),
                    health_checked: supervisor.has_health_check(),
                    status: supervisor.subscribe(),
                })
                .collect(),
        );

        let mut services = Vec::with_capacity(supervisors.len());
        for supervisor in supervisors {
            let name = supervisor.name().to_owned();
            let dependencies = self
                .deployment
                .service(&name)
                .map(|spec| spec.depends_on.as_slice())
                .unwrap_or_default()
                .iter()
                .filter_map(|dependency| board.subscribe(dependency))
                .collect();

            let cancel = CancellationToken::new();
            let task = tokio::spawn(run_service(supervisor, dependencies, cancel.clone()));
            services.push(ServiceHandle { name, cancel, task });
        }

        info!(services = ?self.deployment.start_order(), "deployment started");
        Ok(RunningDeployment { services, board })
    }

    async fn supervisor(&self, service: &ServiceSpec) -> Result<Supervisor, OrchestratorError> {
        let mut launch = LaunchSpec::from_argv(&service.command)
            .map_err(|source| OrchestratorError::Launch {
                service: service.name.clone(),
                source,
            })?
            .with_working_dir(service.working_dir.clone());
        for (name, value) in &service.environment {
            launch = launch.with_env(name, value);
        }

        for mount in &service.volumes {
            let external = self
                .deployment
                .volumes()
                .get(&mount.source)
                .is_some_and(|volume| volume.external);
            let path = match external {
                true => self.volumes.existing(&mount.source).await?,
                false => self.volumes.ensure(&mount.source).await?,
            };
            launch = launch.with_env(&mount.target, &path.to_string_lossy());
        }

        let mut supervisor = Supervisor::new(&service.name, self.launcher.clone(), launch)
            .with_image(service.image.clone())
            .with_restart_policy(service.restart)
            .with_stop_grace_period(service.stop_grace_period.as_duration());
        if let Some(check) = &service.healthcheck {
            let probe = probe_for(&check.test).map_err(|source| OrchestratorError::Probe {
                service: service.name.clone(),
                source,
            })?;
            supervisor = supervisor.with_health_check(probe, check.clone());
        }

        Ok(supervisor)
    }
}

async fn run_service(
    supervisor: Supervisor,
    dependencies: Vec<watch::Receiver<ServiceStatus>>,
    cancel: CancellationToken,
) -> ServiceStatus {
    for mut dependency in dependencies {
        tokio::select! {
            _ = cancel.cancelled() => break,
            // a dependency whose supervisor is gone cannot hold us back
            _ = dependency.wait_for(|status| status.state.has_started()) => {}
        }
    }
    supervisor.run(cancel).await
}

struct ServiceHandle {
    name: String,
    cancel: CancellationToken,
    task: JoinHandle<ServiceStatus>,
}

pub struct RunningDeployment {
    /// In start order.
    services: Vec<ServiceHandle>,
    board: StatusBoard,
}

impl RunningDeployment {
    pub fn board(&self) -> StatusBoard {
        self.board.clone()
    }

    /// Stop every service, last started first, waiting for each one to
    /// exit before stopping the next.
    pub async fn stop(self) -> Vec<ServiceStatus> {
        let mut stopped = Vec::with_capacity(self.services.len());
        for service in self.services.into_iter().rev() {
            info!(service = %service.name, "stopping");
            service.cancel.cancel();
            match service.task.await {
                Ok(status) => stopped.push(status),
                Err(error) => warn!(service = %service.name, %error, "supervisor task failed"),
            }
        }
        stopped
    }

    /// Resolves once every supervisor gave up on its service.
    pub async fn wait_all_stopped(&self) {
        for service in &self.services {
            let Some(mut status) = self.board.subscribe(&service.name) else {
                continue;
            };
            // an error means the supervisor is gone, which is stopped too
            if status
                .wait_for(|status| status.state == ServiceState::Stopped)
                .await
                .is_err()
            {
                continue;
            }
        }
    }
}

/// Read-only view of every service's latest status.
#[derive(Clone)]
pub struct StatusBoard {
    entries: Arc<Vec<BoardEntry>>,
}

pub struct BoardEntry {
    pub name: String,
    /// Whether readiness of this service is decided by a health check.
    pub health_checked: bool,
    pub status: watch::Receiver<ServiceStatus>,
}

impl StatusBoard {
    pub fn new(entries: Vec<BoardEntry>) -> Self {
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Statuses in start order.
    pub fn snapshot(&self) -> Vec<ServiceStatus> {
        self.entries
            .iter()
            .map(|entry| entry.status.borrow().clone())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<ServiceStatus> {
        self.entry(name).map(|entry| entry.status.borrow().clone())
    }

    pub fn subscribe(&self, name: &str) -> Option<watch::Receiver<ServiceStatus>> {
        self.entry(name).map(|entry| entry.status.clone())
    }

    /// Every health-checked service is healthy and every other service is
    /// running.
    pub fn is_ready(&self) -> bool {
        self.entries.iter().all(|entry| {
            let state = entry.status.borrow().state;
            match entry.health_checked {
                true => state == ServiceState::Healthy,
                false => matches!(state, ServiceState::Running | ServiceState::Healthy),
            }
        })
    }

    fn entry(&self, name: &str) -> Option<&BoardEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }
}

/// Report the orchestrator's own liveness until cancelled.
pub async fn heartbeat(handle: health::HealthHandle, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => handle.report_healthy(),
        }
    }
}
