use std::future::Future;
use std::time::Duration;

use health::{HealthHandle, HealthRegistry};
use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::database::{Database, DatabaseError};
use crate::router::{router, AppState, Readiness};

/// Answered by `/health` while the service is healthy.
pub const HEALTHY_SUMMARY: &str = "Todo REST API is running";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serve the API on `listener` until `shutdown` resolves, then close the
/// database pool. `database` must already be known to be reachable.
pub async fn serve<F>(
    config: Config,
    database: Database,
    metrics: PrometheusHandle,
    listener: TcpListener,
    shutdown: F,
) -> Result<(), ApiError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let stopping = CancellationToken::new();
    let liveness = HealthRegistry::new("liveness", HEALTHY_SUMMARY);
    let readiness = Readiness::new(stopping.clone());

    let interval = config.db_monitor_interval.0;
    let database_health = liveness.register("database", interval.saturating_mul(3));
    let monitor = tokio::spawn(monitor_database(
        database.clone(),
        database_health,
        readiness.clone(),
        interval,
        stopping.clone(),
    ));

    let app = router(
        AppState {
            liveness,
            readiness,
        },
        metrics,
    );

    info!("listening on {:?}", listener.local_addr()?);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown({
            let stopping = stopping.clone();
            async move {
                shutdown.await;
                info!("shutting down gracefully");
                stopping.cancel();
            }
        })
        .await;

    stopping.cancel();
    if let Err(error) = monitor.await {
        warn!(%error, "database monitor failed");
    }
    database.close().await;

    Ok(result?)
}

/// Ping the database on a fixed cadence, independent of traffic, and report
/// the outcome to the liveness registry and the readiness flag.
async fn monitor_database(
    database: Database,
    health: HealthHandle,
    readiness: Readiness,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match database.ping().await {
            Ok(()) => {
                readiness.set_database_up(true);
                health.report_healthy();
                metrics::gauge!("database_up").set(1.0);
            }
            Err(error) => {
                warn!(%error, "database ping failed");
                readiness.set_database_up(false);
                health.report_unhealthy();
                metrics::gauge!("database_up").set(0.0);
            }
        }
    }
}
