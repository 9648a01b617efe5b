//! Health, readiness, metrics and stats endpoints

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use sm_notify::{Notificator, NotificatorStats};
use tower_http::trace::TraceLayer;
use tracing::debug;

#[derive(Clone)]
pub struct AppState {
    pub notificator: Arc<Notificator>,
    pub prometheus: PrometheusHandle,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct ProbeResponse {
    status: &'static str,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Ready once the change feed is connected and answers a ping
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    if !state.notificator.is_connected() {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(ProbeResponse { status: "NOT_READY" }));
    }
    if let Err(e) = state.notificator.ping().await {
        debug!(error = %e, "Readiness ping failed");
        return (StatusCode::SERVICE_UNAVAILABLE, Json(ProbeResponse { status: "NOT_READY" }));
    }
    (StatusCode::OK, Json(ProbeResponse { status: "READY" }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

async fn stats_handler(State(state): State<AppState>) -> Json<NotificatorStats> {
    Json(state.notificator.stats().await)
}
