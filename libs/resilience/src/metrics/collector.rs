use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

#[cfg(feature = "config")]
use core_config::{env_parse, ConfigError, FromEnv};

use super::prometheus;
use crate::change_stream::ChangeNotification;
use crate::circuit_breaker::CircuitEvent;
use crate::common::{as_millis, RingBuffer};
use crate::connection::{ConnectionEvent, OperationKind};
use crate::health::{HealthEvent, HealthState};

const HOUR_SECS: i64 = 3600;
const DAY_SECS: i64 = 86_400;

/// Retention for the metrics collector
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Raw samples kept for point and range queries
    pub sample_capacity: usize,

    /// Hourly roll-ups kept
    pub hourly_capacity: usize,

    /// Daily roll-ups kept
    pub daily_capacity: usize,

    /// How often closed periods are flushed when no samples arrive
    pub rollup_interval: Duration,
}

impl MetricsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sample_capacity(mut self, capacity: usize) -> Self {
        self.sample_capacity = capacity;
        self
    }

    pub fn with_rollup_capacity(mut self, hourly: usize, daily: usize) -> Self {
        self.hourly_capacity = hourly;
        self.daily_capacity = daily;
        self
    }

    pub fn with_rollup_interval(mut self, interval: Duration) -> Self {
        self.rollup_interval = interval;
        self
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_capacity: 1000,
            hourly_capacity: 48,
            daily_capacity: 30,
            rollup_interval: Duration::from_secs(3600),
        }
    }
}

/// Environment variables:
/// - `METRICS_SAMPLE_CAPACITY` (default: 1000)
/// - `METRICS_HOURLY_CAPACITY` (default: 48)
/// - `METRICS_DAILY_CAPACITY` (default: 30)
/// - `METRICS_ROLLUP_INTERVAL_SECS` (default: 3600)
#[cfg(feature = "config")]
impl FromEnv for MetricsConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            sample_capacity: env_parse("METRICS_SAMPLE_CAPACITY", defaults.sample_capacity)?,
            hourly_capacity: env_parse("METRICS_HOURLY_CAPACITY", defaults.hourly_capacity)?,
            daily_capacity: env_parse("METRICS_DAILY_CAPACITY", defaults.daily_capacity)?,
            rollup_interval: Duration::from_secs(env_parse("METRICS_ROLLUP_INTERVAL_SECS", 3600u64)?),
        })
    }
}

/// What a sample measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SampleKind {
    Operation {
        kind: OperationKind,
        success: bool,
        latency_ms: u64,
        retries: u32,
    },
    Connection {
        event: String,
    },
    Probe {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        latency_ms: Option<u64>,
    },
    Health {
        status: HealthState,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SampleKind,
}

impl MetricSample {
    pub fn new(kind: SampleKind) -> Self {
        Self { at: Utc::now(), kind }
    }

    pub fn at(at: DateTime<Utc>, kind: SampleKind) -> Self {
        Self { at, kind }
    }
}

/// Aggregate of every sample in one hour or one day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    pub period_start: DateTime<Utc>,
    pub operations: u64,
    pub failures: u64,
    pub retries: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub connection_events: u64,
    pub disconnects: u64,
    pub errors: u64,
    pub probes: u64,
    pub failed_probes: u64,
    pub unhealthy_transitions: u64,
}

impl Rollup {
    fn starting(period_start: DateTime<Utc>) -> Self {
        Self {
            period_start,
            ..Self::default()
        }
    }

    fn absorb(&mut self, kind: &SampleKind) {
        match kind {
            SampleKind::Operation {
                success,
                latency_ms,
                retries,
                ..
            } => {
                let total = self.avg_latency_ms * self.operations as f64 + *latency_ms as f64;
                self.operations += 1;
                self.avg_latency_ms = total / self.operations as f64;
                self.max_latency_ms = self.max_latency_ms.max(*latency_ms);
                self.retries += u64::from(*retries);
                if !success {
                    self.failures += 1;
                }
            }
            SampleKind::Connection { event } => {
                self.connection_events += 1;
                match event.as_str() {
                    "disconnected" => self.disconnects += 1,
                    "error" => self.errors += 1,
                    _ => {}
                }
            }
            SampleKind::Probe { success, .. } => {
                self.probes += 1;
                if !success {
                    self.failed_probes += 1;
                }
            }
            SampleKind::Health { status } => {
                if *status == HealthState::Unhealthy {
                    self.unhealthy_transitions += 1;
                }
            }
        }
    }
}

/// Point-in-time view returned by [`MetricsCollector::current`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub totals: Rollup,
    pub current_hour: Rollup,
    pub current_day: Rollup,
    pub samples: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sample: Option<MetricSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthState>,
}

struct CollectorState {
    samples: RingBuffer<MetricSample>,
    hourly: RingBuffer<Rollup>,
    daily: RingBuffer<Rollup>,
    current_hour: Rollup,
    current_day: Rollup,
    totals: Rollup,
    health: Option<HealthState>,
}

impl CollectorState {
    /// Close the current hour and day if `now` lies past them.
    fn roll_up(&mut self, now: DateTime<Utc>) {
        let hour = period_start(now, HOUR_SECS);
        if hour > self.current_hour.period_start {
            let closed = std::mem::replace(&mut self.current_hour, Rollup::starting(hour));
            self.hourly.push(closed);
        }

        let day = period_start(now, DAY_SECS);
        if day > self.current_day.period_start {
            let closed = std::mem::replace(&mut self.current_day, Rollup::starting(day));
            self.daily.push(closed);
        }
    }
}

/// Passive aggregation of connection and health events.
///
/// Raw samples and roll-ups live in fixed-size buffers that evict the oldest
/// entry, so bursts never grow memory. Every sample is also exported through
/// the Prometheus recorder when one is installed.
pub struct MetricsCollector {
    config: MetricsConfig,
    state: Mutex<CollectorState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        Self::starting_at(config, Utc::now())
    }

    /// Collector whose first periods begin at `now`.
    pub fn starting_at(config: MetricsConfig, now: DateTime<Utc>) -> Self {
        let state = CollectorState {
            samples: RingBuffer::new(config.sample_capacity),
            hourly: RingBuffer::new(config.hourly_capacity),
            daily: RingBuffer::new(config.daily_capacity),
            current_hour: Rollup::starting(period_start(now, HOUR_SECS)),
            current_day: Rollup::starting(period_start(now, DAY_SECS)),
            totals: Rollup::starting(now),
            health: None,
        };

        Self {
            config,
            state: Mutex::new(state),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Add a sample, closing any periods that ended before it.
    pub fn record(&self, sample: MetricSample) {
        let mut state = self.lock_state();
        state.roll_up(sample.at);
        state.current_hour.absorb(&sample.kind);
        state.current_day.absorb(&sample.kind);
        state.totals.absorb(&sample.kind);
        if let SampleKind::Health { status } = sample.kind {
            state.health = Some(status);
        }
        state.samples.push(sample);
    }

    /// Close elapsed periods without adding a sample.
    pub fn roll_up(&self, now: DateTime<Utc>) {
        self.lock_state().roll_up(now);
    }

    pub fn handle_connection_event(&self, event: &ConnectionEvent) {
        prometheus::record_connection_event(event.name());

        match event {
            ConnectionEvent::OperationCompleted {
                kind,
                success,
                duration,
                retries,
            } => {
                prometheus::record_operation(*kind, *success, *duration, *retries);
                self.record(MetricSample::new(SampleKind::Operation {
                    kind: *kind,
                    success: *success,
                    latency_ms: as_millis(*duration),
                    retries: *retries,
                }));
            }
            other => self.record(MetricSample::new(SampleKind::Connection {
                event: other.name().to_string(),
            })),
        }
    }

    pub fn handle_health_event(&self, event: &HealthEvent) {
        match event {
            HealthEvent::ProbeCompleted(probe) => {
                if let Some(latency_ms) = probe.latency_ms {
                    prometheus::record_probe_latency(Duration::from_millis(latency_ms));
                }
                self.record(MetricSample::at(
                    probe.at,
                    SampleKind::Probe {
                        success: probe.success,
                        latency_ms: probe.latency_ms,
                    },
                ));
            }
            other => {
                if let Some(status) = other.status() {
                    prometheus::record_health_status(status);
                    self.record(MetricSample::new(SampleKind::Health { status }));
                }
            }
        }
    }

    pub fn handle_circuit_event(&self, event: &CircuitEvent) {
        prometheus::record_breaker_state(&event.breaker, event.transition.to);
    }

    pub fn handle_change_notification(&self, notification: &ChangeNotification) {
        if let ChangeNotification::Change(event) = notification {
            prometheus::record_change_event(&event.collection, event.operation_type.as_ref());
        }
    }

    /// Current totals and open periods.
    pub fn current(&self) -> MetricsSnapshot {
        let state = self.lock_state();
        MetricsSnapshot {
            totals: state.totals.clone(),
            current_hour: state.current_hour.clone(),
            current_day: state.current_day.clone(),
            samples: state.samples.len(),
            last_sample: state.samples.latest().cloned(),
            health: state.health,
        }
    }

    /// Retained samples with `from <= at < to`, oldest first.
    pub fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<MetricSample> {
        self.lock_state()
            .samples
            .iter()
            .filter(|sample| sample.at >= from && sample.at < to)
            .cloned()
            .collect()
    }

    /// Closed hourly roll-ups, newest first.
    pub fn hourly(&self, limit: usize) -> Vec<Rollup> {
        self.lock_state().hourly.iter().rev().take(limit).cloned().collect()
    }

    /// Closed daily roll-ups, newest first.
    pub fn daily(&self, limit: usize) -> Vec<Rollup> {
        self.lock_state().daily.iter().rev().take(limit).cloned().collect()
    }

    /// Consume connection and health events, flushing roll-ups every
    /// `rollup_interval`.
    pub fn spawn(
        self: &Arc<Self>,
        mut connection: broadcast::Receiver<ConnectionEvent>,
        mut health: broadcast::Receiver<HealthEvent>,
    ) {
        let collector = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(collector.config.rollup_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let (mut connection_open, mut health_open) = (true, true);
            while connection_open || health_open {
                tokio::select! {
                    event = connection.recv(), if connection_open => match event {
                        Ok(event) => collector.handle_connection_event(&event),
                        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Metrics collector lagged behind connection events"),
                        Err(RecvError::Closed) => connection_open = false,
                    },
                    event = health.recv(), if health_open => match event {
                        Ok(event) => collector.handle_health_event(&event),
                        Err(RecvError::Lagged(skipped)) => warn!(skipped, "Metrics collector lagged behind health events"),
                        Err(RecvError::Closed) => health_open = false,
                    },
                    _ = ticker.tick() => collector.roll_up(Utc::now()),
                }
            }
            debug!("Metrics collector stopped");
        });
        self.task_slots().push(handle);
    }

    /// Export breaker state changes as gauges.
    pub fn watch_circuits(self: &Arc<Self>, mut circuits: broadcast::Receiver<CircuitEvent>) {
        let collector = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match circuits.recv().await {
                    Ok(event) => collector.handle_circuit_event(&event),
                    Err(RecvError::Lagged(skipped)) => debug!(skipped, "Metrics collector lagged behind breaker events"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.task_slots().push(handle);
    }

    /// Count delivered change events per collection and operation.
    pub fn watch_change_streams(self: &Arc<Self>, mut notifications: broadcast::Receiver<ChangeNotification>) {
        let collector = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(notification) => collector.handle_change_notification(&notification),
                    Err(RecvError::Lagged(skipped)) => debug!(skipped, "Metrics collector lagged behind change events"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.task_slots().push(handle);
    }

    pub fn stop(&self) {
        for handle in self.task_slots().drain(..) {
            handle.abort();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn task_slots(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn period_start(at: DateTime<Utc>, period_secs: i64) -> DateTime<Utc> {
    let secs = at.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(period_secs), 0).unwrap_or(at)
}
