use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use stack_common::metrics::with_metrics;

use crate::orchestrator::StatusBoard;

#[derive(Clone)]
pub struct AppState {
    pub board: StatusBoard,
    pub liveness: HealthRegistry,
    /// Cancelled once the orchestrator starts shutting the deployment down.
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState, metrics: PrometheusHandle) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/status", get(statuses))
        .route("/status/:name", get(service_status))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(liveness))
        .with_state(state);

    with_metrics(router, metrics).layer(TraceLayer::new_for_http())
}

pub async fn index() -> &'static str {
    "stack orchestrator"
}

async fn statuses(State(state): State<AppState>) -> Response {
    Json(state.board.snapshot()).into_response()
}

async fn service_status(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.board.get(&name) {
        Some(status) => Json(status).into_response(),
        None => (StatusCode::NOT_FOUND, format!("unknown service {name}")).into_response(),
    }
}

/// 200 once every service is up, 503 while starting, degraded or stopping.
async fn readiness(State(state): State<AppState>) -> StatusCode {
    match !state.shutdown.is_cancelled() && state.board.is_ready() {
        true => StatusCode::OK,
        false => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn liveness(State(state): State<AppState>) -> Response {
    state.liveness.get_status().into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_json_diff::assert_json_include;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use stack_common::metrics::detached_recorder;
    use stack_common::supervisor::{ServiceState, ServiceStatus};
    use tokio::sync::watch;
    use tower::ServiceExt;

    use super::*;
    use crate::orchestrator::BoardEntry;

    struct Fixture {
        db: watch::Sender<ServiceStatus>,
        app: watch::Sender<ServiceStatus>,
        state: AppState,
    }

    fn fixture() -> Fixture {
        let (db, db_rx) = watch::channel(ServiceStatus::pending("db"));
        let (app, app_rx) = watch::channel(ServiceStatus::pending("app"));
        let board = StatusBoard::new(vec![
            BoardEntry {
                name: "db".to_owned(),
                health_checked: true,
                status: db_rx,
            },
            BoardEntry {
                name: "app".to_owned(),
                health_checked: false,
                status: app_rx,
            },
        ]);

        Fixture {
            db,
            app,
            state: AppState {
                board,
                liveness: HealthRegistry::new("liveness", "stack orchestrator is running"),
                shutdown: CancellationToken::new(),
            },
        }
    }

    async fn get(state: &AppState, uri: &str) -> (StatusCode, Vec<u8>) {
        let app = router(state.clone(), detached_recorder());
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn index() {
        let fixture = fixture();
        let (status, body) = get(&fixture.state, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"stack orchestrator");
    }

    #[tokio::test]
    async fn lists_statuses_in_start_order() {
        let fixture = fixture();
        fixture.db.send_modify(|status| {
            status.state = ServiceState::Healthy;
            status.pid = Some(42);
        });

        let (status, body) = get(&fixture.state, "/status").await;
        assert_eq!(status, StatusCode::OK);

        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_json_include!(
            actual: body,
            expected: json!([
                {"name": "db", "state": "healthy", "pid": 42, "restarts": 0},
                {"name": "app", "state": "pending", "pid": null, "launched_at": null}
            ])
        );
    }

    #[tokio::test]
    async fn single_service_status() {
        let fixture = fixture();
        fixture.app.send_modify(|status| {
            status.state = ServiceState::Unhealthy;
            status.restarts = 3;
            status.last_exit_code = Some(1);
        });

        let (status, body) = get(&fixture.state, "/status/app").await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_json_include!(
            actual: body,
            expected: json!({"name": "app", "state": "unhealthy", "restarts": 3, "last_exit_code": 1})
        );

        let (status, _) = get(&fixture.state, "/status/cache").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn readiness_follows_services() {
        let fixture = fixture();
        assert_eq!(
            get(&fixture.state, "/_readiness").await.0,
            StatusCode::SERVICE_UNAVAILABLE
        );

        // running is not enough for a health-checked service
        fixture.db.send_modify(|status| status.state = ServiceState::Running);
        fixture.app.send_modify(|status| status.state = ServiceState::Running);
        assert_eq!(
            get(&fixture.state, "/_readiness").await.0,
            StatusCode::SERVICE_UNAVAILABLE
        );

        fixture.db.send_modify(|status| status.state = ServiceState::Healthy);
        assert_eq!(get(&fixture.state, "/_readiness").await.0, StatusCode::OK);

        fixture.state.shutdown.cancel();
        assert_eq!(
            get(&fixture.state, "/_readiness").await.0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn liveness_uses_the_registry() {
        let fixture = fixture();
        assert_eq!(
            get(&fixture.state, "/_liveness").await.0,
            StatusCode::INTERNAL_SERVER_ERROR
        );

        fixture
            .state
            .liveness
            .register("heartbeat", Duration::from_secs(30))
            .report_healthy();

        let (status, body) = get(&fixture.state, "/_liveness").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"stack orchestrator is running");
    }

    #[tokio::test]
    async fn exposes_metrics() {
        let fixture = fixture();
        assert_eq!(get(&fixture.state, "/metrics").await.0, StatusCode::OK);
    }
}
