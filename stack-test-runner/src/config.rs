use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use stack_common::duration::SpecDuration;
use stack_common::spec::{HealthCheckSpec, PostgresTarget, ProbeSpec};

/// Run a test suite against a throwaway database.
///
/// Everything but the test directory usually comes from the CI job's
/// environment.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None, args_override_self = true)]
pub struct RunnerConfig {
    /// Directory holding the test suite, appended to the test command
    pub test_dir: PathBuf,

    /// Shell command starting the database. Without it the database is
    /// expected to be provisioned by someone else.
    #[arg(long, env = "DB_COMMAND")]
    pub db_command: Option<String>,

    /// Environment variable through which the database command receives
    /// its scratch data directory
    #[arg(long, env = "DB_DATA_DIR_ENV", default_value = "PGDATA")]
    pub db_data_dir_env: String,

    /// Where scratch data directories are created, defaults to the system
    /// temporary directory
    #[arg(long, env = "SCRATCH_ROOT")]
    pub scratch_root: Option<PathBuf>,

    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    pub db_host: String,

    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    pub db_port: u16,

    #[arg(long, env = "DB_USER", default_value = "test")]
    pub db_user: String,

    #[arg(long, env = "DB_PASSWORD", default_value = "test")]
    pub db_password: String,

    #[arg(long, env = "DB_NAME", default_value = "test")]
    pub db_name: String,

    #[arg(long, env = "DB_PROBE_INTERVAL", default_value = "10s")]
    pub probe_interval: SpecDuration,

    #[arg(long, env = "DB_PROBE_TIMEOUT", default_value = "5s")]
    pub probe_timeout: SpecDuration,

    #[arg(long, env = "DB_PROBE_RETRIES", default_value_t = 5)]
    pub probe_retries: u32,

    #[arg(long, env = "DB_PROBE_START_PERIOD", default_value = "0s")]
    pub probe_start_period: SpecDuration,

    /// How long the database gets to exit after SIGTERM at teardown
    #[arg(long, env = "DB_STOP_GRACE_PERIOD", default_value = "10s")]
    pub db_stop_grace_period: SpecDuration,

    /// Shell command installing the suite's dependencies
    #[arg(long, env = "INSTALL_COMMAND")]
    pub install_command: Option<String>,

    /// Command running the suite; the test directory is appended as its
    /// last argument
    #[arg(long, env = "TEST_COMMAND", default_value = "pytest")]
    pub test_command: String,
}

impl RunnerConfig {
    pub fn postgres_target(&self) -> PostgresTarget {
        PostgresTarget {
            host: self.db_host.clone(),
            port: self.db_port,
            user: self.db_user.clone(),
            password: self.db_password.clone(),
            database: self.db_name.clone(),
        }
    }

    /// The readiness check gating the suite.
    pub fn readiness_check(&self) -> HealthCheckSpec {
        HealthCheckSpec::new(ProbeSpec::Postgres(self.postgres_target()))
            .with_interval(self.probe_interval.0)
            .with_timeout(self.probe_timeout.0)
            .with_retries(self.probe_retries)
            .with_start_period(self.probe_start_period.0)
    }

    pub fn db_stop_grace_period(&self) -> Duration {
        self.db_stop_grace_period.0
    }

    /// Connection settings handed to the install and test commands.
    pub fn db_env(&self) -> [(&'static str, String); 5] {
        [
            ("DB_HOST", self.db_host.clone()),
            ("DB_PORT", self.db_port.to_string()),
            ("DB_USER", self.db_user.clone()),
            ("DB_PASSWORD", self.db_password.clone()),
            ("DB_NAME", self.db_name.clone()),
        ]
    }
}
