use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use stack_common::metrics::with_metrics;

/// Whether this instance should receive traffic.
#[derive(Clone)]
pub struct Readiness {
    shutdown: CancellationToken,
    database_up: Arc<AtomicBool>,
}

impl Readiness {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            database_up: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_database_up(&self, up: bool) {
        self.database_up.store(up, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        !self.shutdown.is_cancelled() && self.database_up.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub liveness: HealthRegistry,
    pub readiness: Readiness,
}

pub fn router(state: AppState, metrics: PrometheusHandle) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/_readiness", get(readiness))
        .with_state(state);

    with_metrics(router, metrics).layer(TraceLayer::new_for_http())
}

pub async fn index() -> &'static str {
    "Todo REST API"
}

/// 200 with the running banner while every background loop reports healthy.
async fn health(State(state): State<AppState>) -> Response {
    state.liveness.get_status().into_response()
}

async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.readiness.is_ready() {
        true => StatusCode::OK,
        false => StatusCode::SERVICE_UNAVAILABLE,
    }
}
