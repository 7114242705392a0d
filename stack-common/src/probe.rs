//! Readiness and health probes.
//!
//! A probe is a synchronous yes/no question asked of a running service. It has
//! no side effects on its target, so asking it again while the target is
//! healthy always answers yes. Callers bound every probe with
//! [`check_with_timeout`].
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;

use crate::spec::{PostgresTarget, ProbeSpec};

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status code {0}")]
    UnexpectedStatus(u16),
    #[error("database is not ready: {0}")]
    Database(#[from] sqlx::Error),
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("probe command exited with code {0:?}")]
    CommandFailed(Option<i32>),
    #[error("invalid probe definition: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> Result<(), ProbeError>;

    /// Short description for logs, without credentials.
    fn describe(&self) -> String;
}

/// Runs a probe, failing it once `timeout` elapses.
pub async fn check_with_timeout(probe: &dyn Probe, timeout: Duration) -> Result<(), ProbeError> {
    match tokio::time::timeout(timeout, probe.check()).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}

/// Build the probe described by a health check definition.
pub fn probe_for(spec: &ProbeSpec) -> Result<Arc<dyn Probe>, ProbeError> {
    let probe: Arc<dyn Probe> = match spec {
        ProbeSpec::Http { url, expect_status } => Arc::new(HttpProbe::new(url, *expect_status)?),
        ProbeSpec::Postgres(target) => Arc::new(PostgresProbe::new(target)),
        ProbeSpec::Tcp { address } => Arc::new(TcpProbe::new(address)),
        ProbeSpec::Command { argv } => Arc::new(CommandProbe::from_argv(argv)?),
        ProbeSpec::Shell { command } => Arc::new(CommandProbe::shell(command)),
    };
    Ok(probe)
}

pub struct HttpProbe {
    client: reqwest::Client,
    url: reqwest::Url,
    expect_status: Option<u16>,
}

impl HttpProbe {
    pub fn new(url: &str, expect_status: Option<u16>) -> Result<Self, ProbeError> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| ProbeError::Invalid(format!("invalid url {url}: {e}")))?;
        let client = reqwest::Client::builder().build()?;

        Ok(Self {
            client,
            url,
            expect_status,
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> Result<(), ProbeError> {
        let response = self.client.get(self.url.clone()).send().await?;
        let status = response.status();

        let ok = match self.expect_status {
            Some(expected) => status.as_u16() == expected,
            None => status.is_success(),
        };
        match ok {
            true => Ok(()),
            false => Err(ProbeError::UnexpectedStatus(status.as_u16())),
        }
    }

    fn describe(&self) -> String {
        format!("GET {}", self.url)
    }
}

/// Opens a session as the configured user on the configured database and
/// runs `SELECT 1`: the server accepts connections and the administrative
/// user and database exist.
pub struct PostgresProbe {
    options: PgConnectOptions,
    target: String,
}

impl PostgresProbe {
    pub fn new(target: &PostgresTarget) -> Self {
        Self {
            options: target.connect_options().disable_statement_logging(),
            target: target.to_string(),
        }
    }
}

#[async_trait]
impl Probe for PostgresProbe {
    async fn check(&self) -> Result<(), ProbeError> {
        let mut conn = self.options.connect().await?;
        sqlx::query("SELECT 1").execute(&mut conn).await?;
        conn.close().await?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.target.clone()
    }
}

pub struct TcpProbe {
    address: String,
}

impl TcpProbe {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_owned(),
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self) -> Result<(), ProbeError> {
        TcpStream::connect(self.address.as_str()).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.address)
    }
}

/// Healthy when the command exits with status 0. The child is killed if the
/// probe is abandoned on timeout.
pub struct CommandProbe {
    program: String,
    args: Vec<String>,
}

impl CommandProbe {
    pub fn from_argv(argv: &[String]) -> Result<Self, ProbeError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProbeError::Invalid("empty probe command".to_owned()))?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn shell(command: &str) -> Self {
        Self {
            program: "sh".to_owned(),
            args: vec!["-c".to_owned(), command.to_owned()],
        }
    }
}

#[async_trait]
impl Probe for CommandProbe {
    async fn check(&self) -> Result<(), ProbeError> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await?;

        match status.success() {
            true => Ok(()),
            false => Err(ProbeError::CommandFailed(status.code())),
        }
    }

    fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
