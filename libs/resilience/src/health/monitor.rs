use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use strum::{AsRefStr, Display};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::config::HealthMonitorConfig;
use crate::common::{as_millis, RingBuffer};
use crate::connection::ManagedConnection;
use crate::error::{ResilienceError, ResilienceResult};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection health as judged by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Warning,
    Unhealthy,
}

impl HealthState {
    /// Gauge value: 1 healthy, 0.5 warning, 0 unhealthy.
    pub fn score(&self) -> f64 {
        match self {
            HealthState::Healthy => 1.0,
            HealthState::Warning => 0.5,
            HealthState::Unhealthy => 0.0,
        }
    }
}

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub at: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeResult {
    fn success(latency_ms: u64) -> Self {
        Self {
            at: Utc::now(),
            success: true,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    fn failure(error: String) -> Self {
        Self {
            at: Utc::now(),
            success: false,
            latency_ms: None,
            error: Some(error),
        }
    }
}

/// Progress of connection recovery attempts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub in_progress: bool,
    pub attempts: u32,
    pub successes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum HealthEvent {
    ProbeCompleted(ProbeResult),
    Healthy { previous: HealthState },
    Warning { avg_latency_ms: f64 },
    Unhealthy { consecutive_failures: u32, error: String },
    /// Consecutive failures reached the alert threshold
    Alert { consecutive_failures: u32, error: String },
    Recovered { attempts: u32 },
    RecoveryFailed { attempts: u32, error: String },
}

impl HealthEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HealthEvent::ProbeCompleted(_) => "probe_completed",
            HealthEvent::Healthy { .. } => "healthy",
            HealthEvent::Warning { .. } => "warning",
            HealthEvent::Unhealthy { .. } => "unhealthy",
            HealthEvent::Alert { .. } => "alert",
            HealthEvent::Recovered { .. } => "recovered",
            HealthEvent::RecoveryFailed { .. } => "recovery_failed",
        }
    }

    /// The status this event moves the connection to, if any.
    pub fn status(&self) -> Option<HealthState> {
        match self {
            HealthEvent::Healthy { .. } => Some(HealthState::Healthy),
            HealthEvent::Warning { .. } => Some(HealthState::Warning),
            HealthEvent::Unhealthy { .. } => Some(HealthState::Unhealthy),
            _ => None,
        }
    }
}

/// Serializable view of the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub status: HealthState,
    pub consecutive_failures: u32,
    pub total_probes: u64,
    pub failed_probes: u64,
    pub avg_latency_ms: Option<f64>,
    pub last_probe: Option<ProbeResult>,
    pub recovery: RecoveryState,
    pub running: bool,
}

struct MonitorState {
    status: HealthState,
    consecutive_failures: u32,
    latencies: RingBuffer<u64>,
    total_probes: u64,
    failed_probes: u64,
    last_probe: Option<ProbeResult>,
    recovery: RecoveryState,
}

impl MonitorState {
    fn avg_latency_ms(&self) -> Option<f64> {
        if self.latencies.is_empty() {
            return None;
        }
        let sum: u64 = self.latencies.iter().sum();
        Some(sum as f64 / self.latencies.len() as f64)
    }
}

/// Periodic ping-based health monitor for a managed connection.
///
/// Rules, evaluated after every probe:
/// - `unhealthy_threshold` consecutive failures: unhealthy
/// - average latency of the last `latency_window` probes above `critical_latency_ms`: warning
/// - otherwise: healthy
///
/// Only transitions are published. An unhealthy connection is reconnected
/// automatically when `auto_recovery` is set; recoveries never overlap.
pub struct ConnectionHealthMonitor {
    connection: Arc<dyn ManagedConnection>,
    config: HealthMonitorConfig,
    state: Mutex<MonitorState>,
    recovering: AtomicBool,
    events: broadcast::Sender<HealthEvent>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHealthMonitor {
    pub fn new(connection: Arc<dyn ManagedConnection>, config: HealthMonitorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (stop, _) = watch::channel(false);
        let window = config.latency_window;

        Self {
            connection,
            config,
            state: Mutex::new(MonitorState {
                status: HealthState::Healthy,
                consecutive_failures: 0,
                latencies: RingBuffer::new(window),
                total_probes: 0,
                failed_probes: 0,
                last_probe: None,
                recovery: RecoveryState::default(),
            }),
            recovering: AtomicBool::new(false),
            events,
            stop,
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> HealthState {
        self.lock_state().status
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    pub fn recovery_state(&self) -> RecoveryState {
        let mut recovery = self.lock_state().recovery.clone();
        recovery.in_progress = self.is_recovering();
        recovery
    }

    pub fn is_running(&self) -> bool {
        self.task_slot()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let running = self.is_running();
        let in_progress = self.is_recovering();
        let state = self.lock_state();
        let mut recovery = state.recovery.clone();
        recovery.in_progress = in_progress;

        MonitorSnapshot {
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            total_probes: state.total_probes,
            failed_probes: state.failed_probes,
            avg_latency_ms: state.avg_latency_ms(),
            last_probe: state.last_probe.clone(),
            recovery,
            running,
        }
    }

    /// Run one probe and apply the health rules.
    #[instrument(skip(self))]
    pub async fn probe_once(&self) -> ProbeResult {
        let probe = match tokio::time::timeout(self.config.probe_timeout, self.connection.ping()).await {
            Ok(Ok(latency)) => ProbeResult::success(as_millis(latency)),
            Ok(Err(err)) => ProbeResult::failure(err.to_string()),
            Err(_) => ProbeResult::failure(format!(
                "probe timed out after {}ms",
                as_millis(self.config.probe_timeout)
            )),
        };

        match (&probe.latency_ms, &probe.error) {
            (Some(latency_ms), _) => debug!(latency_ms, "Health probe succeeded"),
            (_, Some(error)) => warn!(error = %error, "Health probe failed"),
            _ => {}
        }

        let transitions = self.evaluate(&probe);
        self.emit(HealthEvent::ProbeCompleted(probe.clone()));
        for event in transitions {
            self.emit(event);
        }

        probe
    }

    fn evaluate(&self, probe: &ProbeResult) -> Vec<HealthEvent> {
        let mut state = self.lock_state();
        let mut events = Vec::new();

        state.total_probes += 1;
        state.last_probe = Some(probe.clone());

        let next = if let Some(latency_ms) = probe.latency_ms {
            state.consecutive_failures = 0;
            state.latencies.push(latency_ms);
            let avg = state.avg_latency_ms().unwrap_or_default();
            if avg > self.config.critical_latency_ms as f64 {
                HealthState::Warning
            } else {
                HealthState::Healthy
            }
        } else {
            state.failed_probes += 1;
            state.consecutive_failures += 1;
            let error = probe.error.clone().unwrap_or_default();

            if state.consecutive_failures == self.config.alert_threshold {
                events.push(HealthEvent::Alert {
                    consecutive_failures: state.consecutive_failures,
                    error,
                });
            }

            if state.consecutive_failures >= self.config.unhealthy_threshold {
                HealthState::Unhealthy
            } else {
                state.status
            }
        };

        if next != state.status {
            let previous = state.status;
            state.status = next;
            info!(from = %previous, to = %next, "Connection health changed");

            events.push(match next {
                HealthState::Healthy => HealthEvent::Healthy { previous },
                HealthState::Warning => HealthEvent::Warning {
                    avg_latency_ms: state.avg_latency_ms().unwrap_or_default(),
                },
                HealthState::Unhealthy => HealthEvent::Unhealthy {
                    consecutive_failures: state.consecutive_failures,
                    error: probe.error.clone().unwrap_or_default(),
                },
            });
        }

        events
    }

    /// Whether the periodic loop should start a recovery now.
    pub fn should_auto_recover(&self) -> bool {
        self.config.auto_recovery && self.status() == HealthState::Unhealthy && !self.is_recovering()
    }

    /// Reconnect the managed connection, then probe it.
    ///
    /// Fails without doing anything if a recovery is already running.
    #[instrument(skip(self))]
    pub async fn trigger_recovery(&self) -> ResilienceResult<RecoveryState> {
        if self.recovering.swap(true, Ordering::SeqCst) {
            return Err(ResilienceError::HealthCheckFailed(
                "recovery already in progress".to_string(),
            ));
        }
        let _guard = RecoveryGuard(&self.recovering);

        let attempts = {
            let mut state = self.lock_state();
            state.recovery.attempts += 1;
            state.recovery.last_attempt_at = Some(Utc::now());
            state.recovery.attempts
        };
        warn!(attempt = attempts, "Attempting database connection recovery");

        match self.connection.reconnect().await {
            Ok(()) => {
                {
                    let mut state = self.lock_state();
                    state.recovery.successes += 1;
                    state.recovery.last_error = None;
                }
                info!(attempt = attempts, "Database connection recovered");
                self.emit(HealthEvent::Recovered { attempts });
                self.probe_once().await;
            }
            Err(err) => {
                self.lock_state().recovery.last_error = Some(err.to_string());
                error!(attempt = attempts, error = %err, "Database connection recovery failed");
                self.emit(HealthEvent::RecoveryFailed {
                    attempts,
                    error: err.to_string(),
                });
            }
        }

        let mut recovery = self.lock_state().recovery.clone();
        recovery.in_progress = false;
        Ok(recovery)
    }

    /// Start the periodic probe loop. A no-op when already running.
    ///
    /// The first probe runs immediately.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.task_slot();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Health monitor already running");
            return;
        }

        self.stop.send_replace(false);
        let mut stop = self.stop.subscribe();
        let monitor = Arc::clone(self);

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = as_millis(monitor.config.check_interval),
                "Health monitor started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.probe_once().await;
                        if monitor.should_auto_recover() {
                            let recovering = Arc::clone(&monitor);
                            tokio::spawn(async move {
                                // Outcome is published as an event
                                let _ = recovering.trigger_recovery().await;
                            });
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Health monitor stopped");
        }));
    }

    /// Stop the probe loop and wait for it to exit.
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        let handle = self.task_slot().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn emit(&self, event: HealthEvent) {
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct RecoveryGuard<'a>(&'a AtomicBool);

impl Drop for RecoveryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
