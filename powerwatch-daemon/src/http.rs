//! HTTP API of powerwatchd.
//!
//! - `GET /health`        liveness, always `ok`
//! - `GET /metrics`       Prometheus text format
//! - `GET /appliances`    last reading per appliance, with staleness
//! - `GET /system/health` daemon health report
//!
//! When an API key is configured every route except `/health` and
//! `/metrics` requires it in the `x-api-key` header.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use tracing::{error, warn};

use crate::health::{DaemonHealth, HealthSources, HealthTracker};
use crate::telemetry::{ReadingView, Telemetry};

pub const API_KEY_ENV: &str = "POWERWATCH_API_KEY";

#[derive(Clone)]
pub struct AppState {
    pub telemetry: Telemetry,
    pub health_tracker: HealthTracker,
    pub health_sources: HealthSources,
    pub api_key: Option<Arc<str>>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(get_metrics))
        .route("/appliances", get(get_appliances))
        .route("/system/health", get(get_system_health))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

async fn require_api_key(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path();
    if path == "/health" || path == "/metrics" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!(path, "rejected request without valid API key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

// GET /metrics
async fn get_metrics(State(app): State<AppState>) -> Response {
    match app.telemetry.render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// GET /appliances
async fn get_appliances(State(app): State<AppState>) -> Json<Vec<ReadingView>> {
    Json(app.telemetry.last_readings())
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<DaemonHealth> {
    Json(app.health_tracker.report(&app.health_sources))
}
