use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::ConnectOptions;
use thiserror::Error;
use tracing::info;

use stack_common::readiness::retry_with_backoff;

use crate::config::{Config, ConfigError};

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("database call timed out after {0:?}")]
    Timeout(Duration),
}

/// Connection pool where every call is bounded: acquiring a connection by the
/// connect timeout, running a query by the query timeout. During an outage
/// callers get an error instead of hanging.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    query_timeout: Duration,
}

impl Database {
    /// Build the pool without touching the database.
    pub fn lazy(config: &Config) -> Result<Self, DatabaseError> {
        let url = config.database_url()?;
        let options = PgConnectOptions::from_str(url.as_str())?.disable_statement_logging();
        let pool = PgPoolOptions::new()
            .max_connections(config.max_pg_connections)
            .acquire_timeout(config.db_connect_timeout.0)
            .connect_lazy_with(options);

        Ok(Self {
            pool,
            query_timeout: config.db_query_timeout.0,
        })
    }

    /// Build the pool and wait until the database answers, retrying with the
    /// configured backoff. Fails once the attempts are exhausted.
    pub async fn connect(config: &Config) -> Result<Self, DatabaseError> {
        let database = Self::lazy(config)?;
        info!(url = %config.redacted_database_url(), "waiting for the database");

        let policy = config.db_retry.policy();
        retry_with_backoff(
            "database",
            &policy,
            config.db_retry.max_attempts,
            |_| database.ping(),
        )
        .await?;

        info!("database is ready");
        Ok(database)
    }

    /// Round trip to the database.
    pub async fn ping(&self) -> Result<(), DatabaseError> {
        let query = sqlx::query("SELECT 1").execute(&self.pool);
        match tokio::time::timeout(self.query_timeout, query).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(DatabaseError::Timeout(self.query_timeout)),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("database pool closed");
    }
}
