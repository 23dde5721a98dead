//! Health HTTP surface.
//!
//! - `GET /health` (200 ok / 503 degraded)
//! - `GET /health/detailed`
//! - `GET /health/metrics?limit=N`
//! - `GET /health/alerts?limit=N`
//! - `GET|POST /health/recovery`
//! - `POST /health/circuit-breakers/reset`
//! - `GET /health/change-streams`, `POST /health/change-streams/restart`
//! - `GET /metrics` (Prometheus)

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::monitor::ConnectionHealthMonitor;
use super::service::HealthCheckService;
use crate::change_stream::ChangeStreamManager;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::error::ResilienceError;
use crate::metrics::{self as resilience_metrics, MetricsCollector};

const MAX_LIMIT: usize = 100;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthRouterState {
    pub service: Arc<HealthCheckService>,
    pub monitor: Arc<ConnectionHealthMonitor>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub change_streams: Option<Arc<ChangeStreamManager>>,
    pub metrics: Option<Arc<MetricsCollector>>,
}

impl HealthRouterState {
    pub fn new(
        service: Arc<HealthCheckService>,
        monitor: Arc<ConnectionHealthMonitor>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            service,
            monitor,
            breakers,
            change_streams: None,
            metrics: None,
        }
    }

    pub fn with_change_streams(mut self, manager: Arc<ChangeStreamManager>) -> Self {
        self.change_streams = Some(manager);
        self
    }

    pub fn with_metrics(mut self, collector: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(collector);
        self
    }

    /// Degraded when the database is unhealthy or disconnected, or a change
    /// stream gave up reconnecting.
    pub fn is_degraded(&self) -> bool {
        self.service.is_degraded()
            || self
                .change_streams
                .as_ref()
                .is_some_and(|streams| streams.has_failures())
    }

    fn overall(&self) -> &'static str {
        if self.is_degraded() { "degraded" } else { "ok" }
    }
}

/// Query parameters for bounded listings.
#[derive(Debug, Deserialize)]
pub struct LimitParams {
    /// Maximum number of entries to return (default: 10, max: 100)
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

/// Query parameters for the change stream restart endpoint.
#[derive(Debug, Deserialize)]
pub struct RestartParams {
    /// Restart only this collection (default: all)
    pub collection: Option<String>,
}

/// Build the health router.
pub fn health_router(state: HealthRouterState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/detailed", get(detailed_handler))
        .route("/health/metrics", get(metrics_history_handler))
        .route("/health/alerts", get(alerts_handler))
        .route("/health/recovery", get(recovery_state_handler).post(trigger_recovery_handler))
        .route("/health/circuit-breakers/reset", post(reset_breakers_handler))
        .route("/health/change-streams", get(change_streams_handler))
        .route("/health/change-streams/restart", post(restart_change_streams_handler))
        .route("/metrics", get(prometheus_handler))
        .with_state(state)
}

/// Overall status.
///
/// `GET /health`
pub async fn health_handler(State(state): State<HealthRouterState>) -> (StatusCode, Json<Value>) {
    let code = if state.is_degraded() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        code,
        Json(json!({
            "status": state.overall(),
            "timestamp": Utc::now(),
        })),
    )
}

/// Status, connection statistics, breakers, streams and recent alerts.
///
/// `GET /health/detailed`
pub async fn detailed_handler(State(state): State<HealthRouterState>) -> Json<Value> {
    let change_streams = state
        .change_streams
        .as_ref()
        .map(|streams| streams.status())
        .unwrap_or_default();

    Json(json!({
        "status": state.overall(),
        "health": state.service.get_metrics(),
        "alerts": state.service.alerts(default_limit()),
        "circuit_breakers": state.breakers.snapshots(),
        "change_streams": change_streams,
        "metrics": state.metrics.as_ref().map(|m| m.current()),
    }))
}

/// Status history, alerts and hourly roll-ups.
///
/// `GET /health/metrics?limit=10`
pub async fn metrics_history_handler(
    State(state): State<HealthRouterState>,
    Query(params): Query<LimitParams>,
) -> Json<Value> {
    // Cap limit at 100
    let limit = params.limit.min(MAX_LIMIT);
    let hourly = state
        .metrics
        .as_ref()
        .map(|m| m.hourly(limit))
        .unwrap_or_default();

    Json(json!({
        "health": state.service.get_detailed_metrics(limit),
        "hourly": hourly,
        "limit": limit,
    }))
}

/// Alert log, newest first.
///
/// `GET /health/alerts?limit=10`
pub async fn alerts_handler(
    State(state): State<HealthRouterState>,
    Query(params): Query<LimitParams>,
) -> Json<Value> {
    let limit = params.limit.min(MAX_LIMIT);
    let alerts = state.service.alerts(limit);
    Json(json!({
        "alerts": alerts,
        "count": alerts.len(),
        "limit": limit,
    }))
}

/// `GET /health/recovery`
pub async fn recovery_state_handler(State(state): State<HealthRouterState>) -> Json<Value> {
    Json(json!({ "recovery": state.monitor.recovery_state() }))
}

/// Start a recovery in the background.
///
/// `POST /health/recovery`
pub async fn trigger_recovery_handler(State(state): State<HealthRouterState>) -> (StatusCode, Json<Value>) {
    if state.monitor.is_recovering() {
        return (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "Recovery already in progress",
                "recovery": state.monitor.recovery_state(),
            })),
        );
    }

    info!("Manual database recovery requested");
    let monitor = Arc::clone(&state.monitor);
    tokio::spawn(async move {
        // Outcome is recorded in the recovery state and published as an event
        let _ = monitor.trigger_recovery().await;
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "message": "Recovery started",
        })),
    )
}

/// `POST /health/circuit-breakers/reset`
pub async fn reset_breakers_handler(State(state): State<HealthRouterState>) -> Json<Value> {
    let reset = state.breakers.reset_all();
    info!(reset, "Circuit breakers reset");
    Json(json!({
        "success": true,
        "reset": reset,
        "circuit_breakers": state.breakers.snapshots(),
    }))
}

/// `GET /health/change-streams`
pub async fn change_streams_handler(State(state): State<HealthRouterState>) -> Json<Value> {
    let streams = state
        .change_streams
        .as_ref()
        .map(|streams| streams.status())
        .unwrap_or_default();
    let failed = streams.iter().any(|s| s.failed);

    Json(json!({
        "streams": streams,
        "failed": failed,
    }))
}

/// `POST /health/change-streams/restart?collection=users`
pub async fn restart_change_streams_handler(
    State(state): State<HealthRouterState>,
    Query(params): Query<RestartParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(streams) = state.change_streams.as_ref() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Change streams are not enabled" })),
        ));
    };

    match streams.restart(params.collection.as_deref()) {
        Ok(restarted) => Ok(Json(json!({
            "success": true,
            "restarted": restarted,
        }))),
        Err(ResilienceError::ChangeStream { collection, message }) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": message,
                "collection": collection,
            })),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// Prometheus metrics endpoint handler.
///
/// `GET /metrics`
pub async fn prometheus_handler() -> impl IntoResponse {
    match resilience_metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}
