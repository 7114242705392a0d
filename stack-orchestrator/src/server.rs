//! The `up` lifecycle: status API, supervised deployment, ordered shutdown.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stack_common::launcher::Launcher;
use stack_common::supervisor::ServiceStatus;

use crate::config::Config;
use crate::descriptor::Deployment;
use crate::handlers::{self, AppState};
use crate::orchestrator::{heartbeat, Orchestrator, OrchestratorError};
use crate::volume::VolumeStore;

pub const HEALTHY_SUMMARY: &str = "stack orchestrator is running";

#[derive(Error, Debug)]
pub enum UpError {
    #[error("failed to bind status api on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Run `deployment` until `shutdown` resolves or every service has stopped
/// on its own, then stop the services in reverse start order and return
/// their final statuses.
///
/// The status port is bound before any service is launched, so a taken port
/// fails the command without leaving processes behind.
pub async fn up<F>(
    config: &Config,
    deployment: Deployment,
    launcher: Arc<dyn Launcher>,
    metrics: PrometheusHandle,
    shutdown: F,
) -> Result<Vec<ServiceStatus>, UpError>
where
    F: Future<Output = ()>,
{
    let address = config.bind();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|source| UpError::Bind {
            address: address.clone(),
            source,
        })?;

    let liveness = HealthRegistry::new("liveness", HEALTHY_SUMMARY);
    let interval = Duration::from_millis(config.heartbeat_interval_ms);
    let heartbeat_handle = liveness.register("heartbeat", interval.saturating_mul(3));

    let running = Orchestrator::new(deployment, VolumeStore::new(&config.volumes_root), launcher)
        .start()
        .await?;

    let stopping = CancellationToken::new();
    let server_stop = CancellationToken::new();
    let app = handlers::router(
        AppState {
            board: running.board(),
            liveness,
            shutdown: stopping.clone(),
        },
        metrics,
    );
    info!(bind = %address, "status api listening");
    let server = {
        let server_stop = server_stop.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_stop.cancelled().await })
                .await
        })
    };
    let heartbeat = tokio::spawn(heartbeat(heartbeat_handle, interval, server_stop.clone()));

    tokio::select! {
        _ = shutdown => {}
        _ = running.wait_all_stopped() => info!("every service has stopped"),
    }

    stopping.cancel();
    let statuses = running.stop().await;

    server_stop.cancel();
    if let Err(error) = heartbeat.await {
        warn!(%error, "heartbeat task failed");
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(%error, "status api failed"),
        Err(error) => warn!(%error, "status api task failed"),
    }

    Ok(statuses)
}
