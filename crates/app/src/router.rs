use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::warn;

use stockres_core::{HealthCheck, HealthReport};

use crate::movement::{NewMovement, StockMovementService};
use crate::problem::ProblemResponse;
use crate::telemetry;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    health: HealthCheck,
    movements: StockMovementService,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, health: HealthCheck, movements: StockMovementService) -> Self {
        Self {
            metrics,
            health,
            movements,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn health(&self) -> &HealthCheck {
        &self.health
    }

    pub fn movements(&self) -> &StockMovementService {
        &self.movements
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/stock-movements", post(create_movement))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.health().check();
    counter!("health_checks_total", "status" => report.status.as_str()).increment(1);
    let code = if report.status.is_ok() {
        StatusCode::OK
    } else {
        warn!(
            stage = "health",
            queue_size = report.data.fallback_queue_size,
            "{}",
            report.description
        );
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

async fn metrics(State(state): State<AppState>) -> Response {
    let report = state.health().check();
    let body = telemetry::render_metrics(state.metrics(), &report);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}

async fn create_movement(
    State(state): State<AppState>,
    Json(request): Json<NewMovement>,
) -> Result<Response, ProblemResponse> {
    let movement = state.movements().record(request).await?;
    Ok((StatusCode::CREATED, Json(movement)).into_response())
}
