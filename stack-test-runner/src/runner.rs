//! One CI job: provision a throwaway database, wait until it answers, run the
//! suite against it and always tear the database down again.
use std::path::PathBuf;
use std::sync::Arc;

use stack_common::launcher::{LaunchError, LaunchSpec, Launcher, Process, ProcessLauncher};
use stack_common::probe::{PostgresProbe, Probe};
use stack_common::readiness::{wait_healthy, ReadinessError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::RunnerConfig;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("failed to create scratch directory {path:?}: {source}")]
    ScratchDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("database never became ready: {0}")]
    DatabaseNotReady(#[from] ReadinessError),
    #[error("install command failed with exit code {0:?}")]
    InstallFailed(Option<i32>),
    #[error("interrupted")]
    Interrupted,
}

/// How the suite ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// `None` when the suite was killed by a signal.
    pub code: Option<i32>,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        self.code.unwrap_or(1)
    }

    pub fn passed(&self) -> bool {
        self.code == Some(0)
    }
}

pub struct TestRunner {
    config: RunnerConfig,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn Probe>,
}

impl TestRunner {
    pub fn new(config: RunnerConfig) -> Self {
        let probe = Arc::new(PostgresProbe::new(&config.postgres_target()));
        Self {
            config,
            launcher: Arc::new(ProcessLauncher),
            probe,
        }
    }

    /// Replace the readiness probe, which otherwise connects with the
    /// configured database credentials.
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Run the job. Cancelling `interrupt` stops whatever is running; the
    /// database is torn down in every case.
    pub async fn run(self, interrupt: CancellationToken) -> Result<RunOutcome, RunnerError> {
        let run_id = Uuid::now_v7();
        let span = info_span!("test_run", %run_id);

        async move {
            let mut database = self.provision(run_id).await?;
            let result = tokio::select! {
                result = self.gate_and_run() => result,
                _ = interrupt.cancelled() => Err(RunnerError::Interrupted),
            };
            database.teardown(&self.config).await;
            result
        }
        .instrument(span)
        .await
    }

    async fn provision(&self, run_id: Uuid) -> Result<ScratchDatabase, RunnerError> {
        let Some(command) = &self.config.db_command else {
            info!("no database command, using an externally provisioned database");
            return Ok(ScratchDatabase::default());
        };

        let root = self
            .config
            .scratch_root
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let data_dir = root.join(format!("stack-test-runner-{run_id}"));
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|source| RunnerError::ScratchDir {
                path: data_dir.clone(),
                source,
            })?;
        let mut database = ScratchDatabase {
            process: None,
            data_dir: Some(data_dir.clone()),
        };

        let spec = self
            .shell(command)
            .with_env(&self.config.db_data_dir_env, &data_dir.to_string_lossy());
        match self.launcher.launch(&spec).await {
            Ok(process) => {
                info!(pid = ?process.id(), data_dir = %data_dir.display(), "database launched");
                database.process = Some(process);
                Ok(database)
            }
            Err(error) => {
                database.teardown(&self.config).await;
                Err(error.into())
            }
        }
    }

    async fn gate_and_run(&self) -> Result<RunOutcome, RunnerError> {
        let check = self.config.readiness_check();
        info!(
            probe = %self.probe.describe(),
            interval = %check.interval,
            retries = check.retries(),
            "waiting for the database"
        );
        wait_healthy(self.probe.as_ref(), &check).await?;

        if let Some(install) = &self.config.install_command {
            info!(command = %install, "installing");
            let code = self.run_to_completion(&self.shell(install)).await?;
            if code != Some(0) {
                return Err(RunnerError::InstallFailed(code));
            }
        }

        // The suite runs as one batch: the test directory is the last
        // positional argument of the command line.
        let script = format!(r#"{} "$@""#, self.config.test_command);
        let suite = self
            .shell(&script)
            .with_arg(&self.config.test_dir.to_string_lossy());
        info!(command = %self.config.test_command, test_dir = %self.config.test_dir.display(), "running the suite");
        let code = self.run_to_completion(&suite).await?;

        let outcome = RunOutcome { code };
        info!(exit_code = ?code, passed = outcome.passed(), "suite finished");
        Ok(outcome)
    }

    /// `sh -c script` with the database connection settings exported.
    fn shell(&self, script: &str) -> LaunchSpec {
        let spec = LaunchSpec {
            program: "sh".to_owned(),
            args: vec!["-c".to_owned(), script.to_owned(), "stack-test-runner".to_owned()],
            ..Default::default()
        };
        self.config
            .db_env()
            .iter()
            .fold(spec, |spec, (name, value)| spec.with_env(name, value))
    }

    async fn run_to_completion(&self, spec: &LaunchSpec) -> Result<Option<i32>, RunnerError> {
        let mut process = self.launcher.launch(spec).await?;
        Ok(process.wait().await)
    }
}

/// The database of one run: its process and scratch data directory, when
/// this runner provisioned them.
#[derive(Default)]
struct ScratchDatabase {
    process: Option<Box<dyn Process>>,
    data_dir: Option<PathBuf>,
}

impl ScratchDatabase {
    async fn teardown(&mut self, config: &RunnerConfig) {
        if let Some(mut process) = self.process.take() {
            let code = process.terminate(config.db_stop_grace_period()).await;
            info!(exit_code = ?code, "database stopped");
        }
        if let Some(dir) = self.data_dir.take() {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => info!(data_dir = %dir.display(), "scratch data removed"),
                Err(error) => warn!(data_dir = %dir.display(), %error, "failed to remove scratch data"),
            }
        }
    }
}
