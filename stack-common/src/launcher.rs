//! Launching and stopping service processes.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("service command is empty")]
    EmptyCommand,
    #[error("failed to spawn {program}: {error}")]
    Spawn {
        program: String,
        #[source]
        error: std::io::Error,
    },
}

/// Everything needed to start one instance of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Added on top of the launcher's own environment.
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn from_argv(argv: &[String]) -> Result<Self, LaunchError> {
        let (program, args) = argv.split_first().ok_or(LaunchError::EmptyCommand)?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            ..Default::default()
        })
    }

    pub fn with_arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_owned());
        self
    }

    pub fn with_env(mut self, name: &str, value: &str) -> Self {
        drop(self.env.insert(name.to_owned(), value.to_owned()));
        self
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }
}

/// A launched service instance.
#[async_trait]
pub trait Process: Send {
    fn id(&self) -> Option<u32>;

    /// Resolves when the process exits, with its exit code (`None` when it
    /// was killed by a signal). Cancel safe.
    async fn wait(&mut self) -> Option<i32>;

    /// Asks the process to terminate and kills it if it is still running
    /// after `grace`.
    async fn terminate(&mut self, grace: Duration) -> Option<i32>;
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn Process>, LaunchError>;
}

/// Runs services as child processes of the current process. Children share
/// our stdout/stderr and are killed if their handle is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn Process>, LaunchError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|error| LaunchError::Spawn {
            program: spec.program.clone(),
            error,
        })?;
        debug!(program = %spec.program, pid = ?child.id(), "spawned child process");

        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    /// tokio only delivers SIGKILL, so SIGTERM goes through `kill(1)`.
    async fn send_sigterm(&self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        let sent = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(error) = sent {
            warn!(pid, %error, "failed to send SIGTERM");
        }
    }
}

#[async_trait]
impl Process for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(error) => {
                warn!(%error, "failed to wait for child process");
                None
            }
        }
    }

    async fn terminate(&mut self, grace: Duration) -> Option<i32> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return status.code();
        }

        self.send_sigterm().await;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(error)) => {
                warn!(%error, "failed to wait for child process");
                None
            }
            Err(_) => {
                warn!(pid = ?self.child.id(), ?grace, "process ignored SIGTERM, killing it");
                if let Err(error) = self.child.kill().await {
                    warn!(%error, "failed to kill child process");
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> LaunchSpec {
        LaunchSpec::from_argv(&["sh".to_owned(), "-c".to_owned(), script.to_owned()]).unwrap()
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            LaunchSpec::from_argv(&[]),
            Err(LaunchError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let mut process = ProcessLauncher.launch(&shell("exit 7")).await.unwrap();
        assert_eq!(process.wait().await, Some(7));
    }

    #[tokio::test]
    async fn passes_environment() {
        let spec = shell(r#"test "$MARKER" = "present""#).with_env("MARKER", "present");
        let mut process = ProcessLauncher.launch(&spec).await.unwrap();
        assert_eq!(process.wait().await, Some(0));
    }

    #[test]
    fn later_environment_value_wins() {
        let spec = shell("true")
            .with_env("MARKER", "first")
            .with_env("MARKER", "second");
        assert_eq!(spec.env.len(), 1);
        assert_eq!(spec.env["MARKER"], "second");
    }

    #[tokio::test]
    async fn terminate_stops_a_running_process() {
        let mut process = ProcessLauncher.launch(&shell("sleep 30")).await.unwrap();
        assert!(process.id().is_some());

        let started = std::time::Instant::now();
        process.terminate(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn terminate_kills_processes_ignoring_sigterm() {
        let mut process = ProcessLauncher
            .launch(&shell("trap '' TERM; sleep 30"))
            .await
            .unwrap();
        // give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        assert_eq!(process.terminate(Duration::from_millis(300)).await, None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let spec = LaunchSpec::from_argv(&["/definitely/not/a/binary".to_owned()]).unwrap();
        assert!(matches!(
            ProcessLauncher.launch(&spec).await,
            Err(LaunchError::Spawn { .. })
        ));
    }
}
