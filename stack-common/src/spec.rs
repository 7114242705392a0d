//! Declarative records describing a deployment: services, their health checks,
//! restart policies and volumes. They are loaded once and never mutated; a
//! redeploy replaces them wholesale.
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use thiserror::Error;

use crate::duration::SpecDuration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceSpec {
    /// Filled from the descriptor key.
    #[serde(default)]
    pub name: String,
    /// Informational image reference, logged at launch.
    #[serde(default)]
    pub image: Option<String>,
    /// Program and arguments to launch.
    pub command: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub healthcheck: Option<HealthCheckSpec>,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period: SpecDuration,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_stop_grace_period() -> SpecDuration {
    SpecDuration::from_secs(10)
}

impl ServiceSpec {
    pub fn new(name: &str, command: Vec<String>) -> Self {
        Self {
            name: name.to_owned(),
            image: None,
            command,
            ports: Vec::new(),
            environment: BTreeMap::new(),
            healthcheck: None,
            restart: RestartPolicy::default(),
            depends_on: Vec::new(),
            volumes: Vec::new(),
            stop_grace_period: default_stop_grace_period(),
            working_dir: None,
        }
    }

    pub fn container_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.iter().map(|binding| binding.container)
    }
}

/// A periodic probe and the budget deciding when its target is unhealthy.
///
/// Failures during `start_period` are not counted, unless a probe already
/// succeeded. After that, `retries` consecutive failures make the target
/// unhealthy, so a target is declared unhealthy at the latest
/// `start_period + retries * interval` after launch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HealthCheckSpec {
    pub test: ProbeSpec,
    #[serde(default = "default_interval")]
    pub interval: SpecDuration,
    #[serde(default = "default_timeout")]
    pub timeout: SpecDuration,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub start_period: SpecDuration,
}

fn default_interval() -> SpecDuration {
    SpecDuration::from_secs(30)
}

fn default_timeout() -> SpecDuration {
    SpecDuration::from_secs(30)
}

fn default_retries() -> u32 {
    3
}

impl HealthCheckSpec {
    pub fn new(test: ProbeSpec) -> Self {
        Self {
            test,
            interval: default_interval(),
            timeout: default_timeout(),
            retries: default_retries(),
            start_period: SpecDuration::default(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.into();
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_start_period(mut self, start_period: Duration) -> Self {
        self.start_period = start_period.into();
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval.0
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.0
    }

    pub fn start_period(&self) -> Duration {
        self.start_period.0
    }

    /// A budget of zero would declare a target unhealthy without a single
    /// counted failure.
    pub fn retries(&self) -> u32 {
        self.retries.max(1)
    }

    /// Upper bound on the time a dependent waits before this target is
    /// declared unhealthy.
    pub fn unhealthy_after(&self) -> Duration {
        self.start_period() + self.interval().saturating_mul(self.retries())
    }
}

/// How a health check observes its target.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// GET `url`, healthy on any 2xx, or exactly `expect_status` when set.
    Http {
        url: String,
        #[serde(default)]
        expect_status: Option<u16>,
    },
    /// `pg_isready` equivalent: the server accepts a session for this user
    /// and database.
    Postgres(PostgresTarget),
    /// The address accepts TCP connections.
    Tcp { address: String },
    /// The command exits with status 0.
    Command { argv: Vec<String> },
    /// `sh -c command` exits with status 0.
    Shell { command: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PostgresTarget {
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
}

fn default_pg_host() -> String {
    "localhost".to_owned()
}

fn default_pg_port() -> u16 {
    5432
}

impl PostgresTarget {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }
}

impl fmt::Display for PostgresTarget {
    /// Never prints the password.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "postgres://{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

/// Governs whether a service that exited or turned unhealthy is relaunched.
/// No policy relaunches a service stopped by the operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    OnFailure,
    UnlessStopped,
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::UnlessStopped => "unless-stopped",
        };
        f.write_str(name)
    }
}

/// `"<host>:<container>"`, or a single port bound on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SpecParseError {
    #[error("invalid port binding {0:?}, expected <host>:<container>")]
    PortBinding(String),
    #[error("invalid volume mount {0:?}, expected <volume>:<ENV_VAR>")]
    VolumeMount(String),
}

impl FromStr for PortBinding {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SpecParseError::PortBinding(s.to_owned());
        let (host, container) = match s.split_once(':') {
            Some((host, container)) => (host, container),
            None => (s, s),
        };
        Ok(PortBinding {
            host: host.trim().parse().map_err(|_| invalid())?,
            container: container.trim().parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for PortBinding {
    type Error = SpecParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortBinding> for String {
    fn from(value: PortBinding) -> Self {
        format!("{}:{}", value.host, value.container)
    }
}

/// Binds a named volume to a service. Services are plain processes, so the
/// volume's data directory is handed over through the `target` environment
/// variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
}

impl FromStr for VolumeMount {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((source, target)) if !source.trim().is_empty() && !target.trim().is_empty() => {
                Ok(VolumeMount {
                    source: source.trim().to_owned(),
                    target: target.trim().to_owned(),
                })
            }
            _ => Err(SpecParseError::VolumeMount(s.to_owned())),
        }
    }
}

impl TryFrom<String> for VolumeMount {
    type Error = SpecParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VolumeMount> for String {
    fn from(value: VolumeMount) -> Self {
        format!("{}:{}", value.source, value.target)
    }
}

/// A durable named storage unit declared at the top of a descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct VolumeSpec {
    /// External volumes are managed by the operator and must already exist.
    #[serde(default)]
    pub external: bool,
}
