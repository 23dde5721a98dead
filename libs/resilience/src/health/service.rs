use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::HealthServiceConfig;
use super::monitor::{ConnectionHealthMonitor, HealthEvent, HealthState, MonitorSnapshot};
use crate::change_stream::ChangeNotification;
use crate::circuit_breaker::{CircuitEvent, CircuitState};
use crate::classification::Severity;
use crate::common::RingBuffer;
use crate::connection::{ConnectionEvent, ConnectionStats, ManagedConnection};

/// Entry in the alert log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: Severity,
    /// Component that raised the alert (`monitor`, `connection`, `circuit_breaker`, `change_stream`)
    pub source: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Entry in the status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<HealthState>,
    pub to: HealthState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Status plus connection statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub status: HealthState,
    pub connection: ConnectionStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorSnapshot>,
    pub timestamp: DateTime<Utc>,
}

/// [`HealthMetrics`] with recent history and alerts, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedHealthMetrics {
    #[serde(flatten)]
    pub metrics: HealthMetrics,
    pub history: Vec<StatusChange>,
    pub alerts: Vec<Alert>,
}

struct ServiceState {
    current: HealthState,
    history: RingBuffer<StatusChange>,
    alerts: RingBuffer<Alert>,
}

/// Aggregates monitor, connection and breaker events into a queryable health view.
///
/// Status changes are idempotent: updating to the current status records nothing.
pub struct HealthCheckService {
    connection: Arc<dyn ManagedConnection>,
    monitor: Option<Arc<ConnectionHealthMonitor>>,
    state: Mutex<ServiceState>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthCheckService {
    pub fn new(connection: Arc<dyn ManagedConnection>, config: HealthServiceConfig) -> Self {
        Self {
            connection,
            monitor: None,
            state: Mutex::new(ServiceState {
                current: HealthState::Healthy,
                history: RingBuffer::new(config.history_capacity),
                alerts: RingBuffer::new(config.alert_capacity),
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Include the monitor's snapshot in reported metrics.
    pub fn with_monitor(mut self, monitor: Arc<ConnectionHealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn monitor(&self) -> Option<&Arc<ConnectionHealthMonitor>> {
        self.monitor.as_ref()
    }

    pub fn current_status(&self) -> HealthState {
        self.lock_state().current
    }

    /// Move to `status`, appending to history. Returns false if nothing changed.
    pub fn update_status(&self, status: HealthState, reason: impl Into<String>) -> bool {
        let mut state = self.lock_state();
        if state.current == status {
            return false;
        }

        let change = StatusChange {
            from: Some(state.current),
            to: status,
            reason: reason.into(),
            at: Utc::now(),
        };
        info!(from = %state.current, to = %status, reason = %change.reason, "Health status updated");
        state.current = status;
        state.history.push(change);
        true
    }

    /// Append to the alert log, evicting the oldest entry when full.
    pub fn record_alert(&self, severity: Severity, source: &str, message: impl Into<String>) -> Alert {
        let alert = Alert {
            id: Uuid::new_v4(),
            severity,
            source: source.to_string(),
            message: message.into(),
            at: Utc::now(),
        };

        match severity {
            Severity::Critical | Severity::High => {
                error!(source, severity = %severity, message = %alert.message, "Health alert")
            }
            _ => warn!(source, severity = %severity, message = %alert.message, "Health alert"),
        }

        self.lock_state().alerts.push(alert.clone());
        alert
    }

    /// Apply a monitor event.
    pub fn handle_event(&self, event: &HealthEvent) {
        match event {
            HealthEvent::ProbeCompleted(_) => {}
            HealthEvent::Healthy { previous } => {
                self.update_status(HealthState::Healthy, format!("recovered from {previous}"));
            }
            HealthEvent::Warning { avg_latency_ms } => {
                if self.update_status(
                    HealthState::Warning,
                    format!("average latency {avg_latency_ms:.0}ms"),
                ) {
                    self.record_alert(
                        Severity::Medium,
                        "monitor",
                        format!("High database latency: {avg_latency_ms:.0}ms average"),
                    );
                }
            }
            HealthEvent::Unhealthy {
                consecutive_failures,
                error,
            } => {
                if self.update_status(
                    HealthState::Unhealthy,
                    format!("{consecutive_failures} consecutive probe failures"),
                ) {
                    self.record_alert(
                        Severity::Critical,
                        "monitor",
                        format!("Database unhealthy after {consecutive_failures} failed probes: {error}"),
                    );
                }
            }
            HealthEvent::Alert {
                consecutive_failures,
                error,
            } => {
                self.record_alert(
                    Severity::High,
                    "monitor",
                    format!("Health probe failed {consecutive_failures} time(s): {error}"),
                );
            }
            HealthEvent::Recovered { attempts } => {
                self.record_alert(
                    Severity::Info,
                    "monitor",
                    format!("Database connection recovered after {attempts} attempt(s)"),
                );
            }
            HealthEvent::RecoveryFailed { attempts, error } => {
                self.record_alert(
                    Severity::High,
                    "monitor",
                    format!("Recovery attempt {attempts} failed: {error}"),
                );
            }
        }
    }

    /// Apply a connection event.
    pub fn handle_connection_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Disconnected { reason } => {
                self.record_alert(
                    Severity::High,
                    "connection",
                    format!("Database disconnected: {reason}"),
                );
            }
            ConnectionEvent::Reconnected => {
                self.record_alert(Severity::Info, "connection", "Database reconnected");
            }
            ConnectionEvent::Error {
                classification,
                message,
            } if classification.severity == Severity::Critical => {
                self.record_alert(
                    Severity::Critical,
                    "connection",
                    format!("{}: {message}", classification.code),
                );
            }
            _ => {}
        }
    }

    /// Apply a circuit breaker event.
    pub fn handle_circuit_event(&self, event: &CircuitEvent) {
        let transition = &event.transition;
        match transition.to {
            CircuitState::Open => {
                self.record_alert(
                    Severity::High,
                    "circuit_breaker",
                    format!("Circuit '{}' opened: {}", event.breaker, transition.reason),
                );
            }
            CircuitState::Closed if transition.from != CircuitState::Closed => {
                self.record_alert(
                    Severity::Info,
                    "circuit_breaker",
                    format!("Circuit '{}' closed", event.breaker),
                );
            }
            _ => {}
        }
    }

    /// Apply a change stream notification.
    pub fn handle_change_notification(&self, notification: &ChangeNotification) {
        match notification {
            ChangeNotification::Failed {
                collection,
                attempts,
                error,
            } => {
                self.record_alert(
                    Severity::Critical,
                    "change_stream",
                    format!("Change stream '{collection}' stopped after {attempts} reconnect attempts: {error}"),
                );
            }
            ChangeNotification::Invalidated { collection } => {
                self.record_alert(
                    Severity::High,
                    "change_stream",
                    format!("Change stream '{collection}' was invalidated"),
                );
            }
            _ => {}
        }
    }

    /// Status and connection statistics.
    pub fn get_metrics(&self) -> HealthMetrics {
        HealthMetrics {
            status: self.current_status(),
            connection: self.connection.stats(),
            monitor: self.monitor.as_ref().map(|m| m.snapshot()),
            timestamp: Utc::now(),
        }
    }

    /// Metrics plus the `limit` most recent status changes and alerts.
    pub fn get_detailed_metrics(&self, limit: usize) -> DetailedHealthMetrics {
        DetailedHealthMetrics {
            metrics: self.get_metrics(),
            history: self.history(limit),
            alerts: self.alerts(limit),
        }
    }

    /// Most recent alerts, newest first.
    pub fn alerts(&self, limit: usize) -> Vec<Alert> {
        self.lock_state().alerts.iter().rev().take(limit).cloned().collect()
    }

    /// Most recent status changes, newest first.
    pub fn history(&self, limit: usize) -> Vec<StatusChange> {
        self.lock_state().history.iter().rev().take(limit).cloned().collect()
    }

    /// Whether the database side is degraded: unhealthy or disconnected.
    pub fn is_degraded(&self) -> bool {
        self.current_status() == HealthState::Unhealthy || !self.connection.is_connected()
    }

    /// Feed monitor, connection and breaker events into this service.
    ///
    /// A closed source is dropped from the loop; the listener stops once all
    /// three have closed.
    pub fn spawn_listener(
        self: &Arc<Self>,
        mut health: broadcast::Receiver<HealthEvent>,
        mut connection: broadcast::Receiver<ConnectionEvent>,
        mut circuits: broadcast::Receiver<CircuitEvent>,
    ) {
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let (mut health_open, mut connection_open, mut circuits_open) = (true, true, true);
            loop {
                tokio::select! {
                    event = health.recv(), if health_open => match event {
                        Ok(event) => service.handle_event(&event),
                        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Health listener lagged behind monitor events"),
                        Err(RecvError::Closed) => health_open = false,
                    },
                    event = connection.recv(), if connection_open => match event {
                        Ok(event) => service.handle_connection_event(&event),
                        Err(RecvError::Lagged(skipped)) => debug!(skipped, "Health listener lagged behind connection events"),
                        Err(RecvError::Closed) => connection_open = false,
                    },
                    event = circuits.recv(), if circuits_open => match event {
                        Ok(event) => service.handle_circuit_event(&event),
                        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Health listener lagged behind breaker events"),
                        Err(RecvError::Closed) => circuits_open = false,
                    },
                    else => break,
                }
            }
            debug!("Health listener stopped");
        });
        self.listener_slots().push(handle);
    }

    /// Raise alerts for change streams that fail or are invalidated.
    pub fn spawn_change_stream_listener(self: &Arc<Self>, mut notifications: broadcast::Receiver<ChangeNotification>) {
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(notification) => service.handle_change_notification(&notification),
                    Err(RecvError::Lagged(skipped)) => debug!(skipped, "Health listener lagged behind change notifications"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.listener_slots().push(handle);
    }

    /// Stop every spawned listener.
    pub fn stop_listeners(&self) {
        for handle in self.listener_slots().drain(..) {
            handle.abort();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listener_slots(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use crate::health::monitor::tests::ScriptedConnection;
    use crate::health::HealthMonitorConfig;
    use std::time::Duration;

    fn service(config: HealthServiceConfig) -> HealthCheckService {
        HealthCheckService::new(Arc::new(ScriptedConnection::new()), config)
    }

    #[test]
    fn test_repeated_status_appends_nothing() {
        let service = service(HealthServiceConfig::default());

        assert!(!service.update_status(HealthState::Healthy, "probe"));
        assert!(service.update_status(HealthState::Warning, "slow"));
        assert!(!service.update_status(HealthState::Warning, "still slow"));
        assert!(service.update_status(HealthState::Healthy, "fast again"));

        let history = service.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].to, HealthState::Healthy);
        assert_eq!(history[1].from, Some(HealthState::Healthy));
    }

    #[test]
    fn test_alert_log_keeps_order_within_capacity() {
        let service = service(HealthServiceConfig::new().with_alert_capacity(3));

        for i in 0..5 {
            service.record_alert(Severity::Low, "test", format!("alert {i}"));
        }

        let messages: Vec<String> = service.alerts(10).into_iter().map(|a| a.message).collect();
        assert_eq!(messages, vec!["alert 4", "alert 3", "alert 2"]);
        assert_eq!(service.alerts(1).len(), 1);
    }

    #[test]
    fn test_unhealthy_event_raises_one_alert() {
        let service = service(HealthServiceConfig::default());
        let event = HealthEvent::Unhealthy {
            consecutive_failures: 3,
            error: "timeout".into(),
        };

        service.handle_event(&event);
        service.handle_event(&event);

        assert_eq!(service.current_status(), HealthState::Unhealthy);
        let alerts = service.alerts(10);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert!(service.is_degraded());
    }

    #[test]
    fn test_detailed_metrics_are_bounded_by_limit() {
        let service = service(HealthServiceConfig::default());
        service.update_status(HealthState::Warning, "a");
        service.update_status(HealthState::Unhealthy, "b");
        service.update_status(HealthState::Healthy, "c");
        for i in 0..4 {
            service.record_alert(Severity::Info, "test", format!("{i}"));
        }

        let detailed = service.get_detailed_metrics(2);
        assert_eq!(detailed.history.len(), 2);
        assert_eq!(detailed.alerts.len(), 2);
        assert_eq!(detailed.metrics.status, HealthState::Healthy);

        let json = serde_json::to_value(&detailed).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(json["connection"]["is_connected"].as_bool().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_follows_monitor_and_breakers() {
        let connection = Arc::new(ScriptedConnection::new());
        let monitor = Arc::new(ConnectionHealthMonitor::new(
            connection.clone(),
            HealthMonitorConfig::new()
                .with_unhealthy_threshold(1)
                .with_auto_recovery(false),
        ));
        let service = Arc::new(
            HealthCheckService::new(connection.clone(), HealthServiceConfig::default())
                .with_monitor(monitor.clone()),
        );
        let breaker = CircuitBreaker::new("orders", CircuitBreakerConfig::new().with_failure_threshold(1));

        service.spawn_listener(monitor.subscribe(), connection.subscribe(), breaker.subscribe());

        connection.fail(true);
        monitor.probe_once().await;
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(service.current_status(), HealthState::Unhealthy);
        let sources: Vec<String> = service.alerts(10).into_iter().map(|a| a.source).collect();
        assert!(sources.contains(&"circuit_breaker".to_string()));
        assert!(sources.contains(&"monitor".to_string()));

        let metrics = service.get_metrics();
        assert_eq!(metrics.monitor.unwrap().failed_probes, 1);
        service.stop_listeners();
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_outlives_a_closed_source() {
        let service = Arc::new(service(HealthServiceConfig::default()));
        let (health_tx, health_rx) = broadcast::channel(8);
        let (connection_tx, connection_rx) = broadcast::channel(8);
        let (circuits_tx, circuits_rx) = broadcast::channel::<CircuitEvent>(8);

        service.spawn_listener(health_rx, connection_rx, circuits_rx);
        drop(circuits_tx);
        tokio::time::sleep(Duration::from_millis(10)).await;

        health_tx
            .send(HealthEvent::Unhealthy {
                consecutive_failures: 3,
                error: "timeout".into(),
            })
            .unwrap();
        connection_tx.send(ConnectionEvent::Reconnected).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(service.current_status(), HealthState::Unhealthy);
        let sources: Vec<String> = service.alerts(10).into_iter().map(|a| a.source).collect();
        assert!(sources.contains(&"connection".to_string()));

        drop(health_tx);
        drop(connection_tx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(service.listener_slots().iter().all(|task| task.is_finished()));
    }

    #[test]
    fn test_failed_change_stream_raises_critical_alert() {
        let service = service(HealthServiceConfig::default());
        service.handle_change_notification(&ChangeNotification::Failed {
            collection: "users".into(),
            attempts: 5,
            error: "no primary".into(),
        });
        service.handle_change_notification(&ChangeNotification::Opened {
            collection: "users".into(),
            resumed: true,
        });

        let alerts = service.alerts(10);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].source, "change_stream");
        assert_eq!(alerts[0].severity, Severity::Critical);
    }
}
