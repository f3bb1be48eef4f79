//! Pool statistics, metrics, and liveness handlers.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use pylon_protocol::http_types::{
    AlertsResponse, HealthResponse, HistoricalMetricsResponse, MetricsResponse,
    PoolStatsResponse,
};

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn pool_stats(State(state): State<AppState>) -> Result<Json<PoolStatsResponse>, ApiError> {
    let stats = state.pool().stats();
    Ok(Json(PoolStatsResponse {
        total: stats.total,
        available: stats.available,
        in_use: stats.in_use,
        healthy: stats.healthy,
        replacing: stats.replacing,
        waiters: stats.waiters,
    }))
}

pub async fn metrics_aggregate(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(state.metrics().aggregate())
}

pub async fn metrics_history(State(state): State<AppState>) -> Json<HistoricalMetricsResponse> {
    Json(HistoricalMetricsResponse {
        snapshots: state.metrics().history(),
    })
}

pub async fn metrics_alerts(State(state): State<AppState>) -> Json<AlertsResponse> {
    Json(AlertsResponse {
        alerts: state.metrics().active_alerts(),
    })
}
