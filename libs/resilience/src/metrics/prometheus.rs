//! Prometheus export for resilience metrics
//!
//! Counters and gauges go through the `metrics` facade and are no-ops until
//! [`init_metrics`] installs the recorder.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

use crate::circuit_breaker::CircuitState;
use crate::connection::OperationKind;
use crate::error::{ResilienceError, ResilienceResult};
use crate::health::HealthState;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder
///
/// Call this once at startup. Subsequent calls return the existing handle.
pub fn init_metrics() -> ResilienceResult<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            ResilienceError::Config(format!("failed to install Prometheus recorder: {e}"))
        })?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format (empty before `init_metrics`)
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

pub fn record_operation(kind: OperationKind, success: bool, duration: Duration, retries: u32) {
    let status = if success { "success" } else { "failed" };
    counter!(
        "db_operations_total",
        "kind" => kind.as_ref().to_string(),
        "status" => status
    )
    .increment(1);

    histogram!(
        "db_operation_duration_seconds",
        "kind" => kind.as_ref().to_string()
    )
    .record(duration.as_secs_f64());

    if retries > 0 {
        counter!(
            "db_operation_retries_total",
            "kind" => kind.as_ref().to_string()
        )
        .increment(u64::from(retries));
    }
}

pub fn record_connection_event(event: &'static str) {
    counter!("db_connection_events_total", "event" => event).increment(1);
}

/// 1 healthy, 0.5 warning, 0 unhealthy
pub fn record_health_status(status: HealthState) {
    gauge!("db_health_status").set(status.score());
}

pub fn record_probe_latency(latency: Duration) {
    histogram!("db_health_probe_latency_seconds").record(latency.as_secs_f64());
}

/// 0 closed, 1 half-open, 2 open
pub fn record_breaker_state(breaker: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("db_circuit_breaker_state", "breaker" => breaker.to_string()).set(value);
}

pub fn record_change_event(collection: &str, operation: &str) {
    counter!(
        "db_change_events_total",
        "collection" => collection.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_before_init_is_empty() {
        if prometheus_handle().is_none() {
            assert!(render_metrics().is_empty());
        }
        // Recording without a recorder is a no-op
        record_operation(OperationKind::Find, true, Duration::from_millis(3), 0);
        record_health_status(HealthState::Warning);
    }
}
