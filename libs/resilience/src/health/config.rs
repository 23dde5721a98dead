use std::time::Duration;

#[cfg(feature = "config")]
use core_config::{env_bool, env_parse, ConfigError, FromEnv};

/// Probe cadence and thresholds for the connection health monitor
#[derive(Clone, Debug)]
pub struct HealthMonitorConfig {
    /// Time between probes
    pub check_interval: Duration,

    /// Limit for a single ping; a slower probe counts as failed
    pub probe_timeout: Duration,

    /// Consecutive probe failures before the connection is unhealthy
    pub unhealthy_threshold: u32,

    /// Consecutive probe failures before an alert is raised
    pub alert_threshold: u32,

    /// Average probe latency above which the connection is in warning
    pub critical_latency_ms: u64,

    /// Number of recent probes averaged for the latency rule
    pub latency_window: usize,

    /// Reconnect automatically when the connection turns unhealthy
    pub auto_recovery: bool,
}

impl HealthMonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_unhealthy_threshold(mut self, threshold: u32) -> Self {
        self.unhealthy_threshold = threshold.max(1);
        self
    }

    pub fn with_alert_threshold(mut self, threshold: u32) -> Self {
        self.alert_threshold = threshold.max(1);
        self
    }

    pub fn with_critical_latency_ms(mut self, latency_ms: u64) -> Self {
        self.critical_latency_ms = latency_ms;
        self
    }

    pub fn with_latency_window(mut self, window: usize) -> Self {
        self.latency_window = window.max(1);
        self
    }

    pub fn with_auto_recovery(mut self, enabled: bool) -> Self {
        self.auto_recovery = enabled;
        self
    }
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            alert_threshold: 1,
            critical_latency_ms: 1000,
            latency_window: 5,
            auto_recovery: true,
        }
    }
}

/// Environment variables:
/// - `HEALTH_CHECK_INTERVAL_MS` (default: 30000)
/// - `HEALTH_PROBE_TIMEOUT_MS` (default: 5000)
/// - `HEALTH_UNHEALTHY_THRESHOLD` (default: 3)
/// - `HEALTH_ALERT_THRESHOLD` (default: 1)
/// - `HEALTH_CRITICAL_LATENCY_MS` (default: 1000)
/// - `HEALTH_LATENCY_WINDOW` (default: 5)
/// - `HEALTH_AUTO_RECOVERY` (default: true)
#[cfg(feature = "config")]
impl FromEnv for HealthMonitorConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self::new()
            .with_check_interval(Duration::from_millis(env_parse(
                "HEALTH_CHECK_INTERVAL_MS",
                30_000u64,
            )?))
            .with_probe_timeout(Duration::from_millis(env_parse(
                "HEALTH_PROBE_TIMEOUT_MS",
                5_000u64,
            )?))
            .with_unhealthy_threshold(env_parse(
                "HEALTH_UNHEALTHY_THRESHOLD",
                defaults.unhealthy_threshold,
            )?)
            .with_alert_threshold(env_parse("HEALTH_ALERT_THRESHOLD", defaults.alert_threshold)?)
            .with_critical_latency_ms(env_parse(
                "HEALTH_CRITICAL_LATENCY_MS",
                defaults.critical_latency_ms,
            )?)
            .with_latency_window(env_parse("HEALTH_LATENCY_WINDOW", defaults.latency_window)?)
            .with_auto_recovery(env_bool("HEALTH_AUTO_RECOVERY", defaults.auto_recovery)?))
    }
}

/// Retention for the health check service
#[derive(Clone, Debug)]
pub struct HealthServiceConfig {
    /// Status changes kept in history
    pub history_capacity: usize,

    /// Alerts kept in the alert log
    pub alert_capacity: usize,
}

impl HealthServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_alert_capacity(mut self, capacity: usize) -> Self {
        self.alert_capacity = capacity;
        self
    }
}

impl Default for HealthServiceConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            alert_capacity: 50,
        }
    }
}

/// Environment variables:
/// - `HEALTH_HISTORY_CAPACITY` (default: 100)
/// - `HEALTH_ALERT_CAPACITY` (default: 50)
#[cfg(feature = "config")]
impl FromEnv for HealthServiceConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            history_capacity: env_parse("HEALTH_HISTORY_CAPACITY", defaults.history_capacity)?,
            alert_capacity: env_parse("HEALTH_ALERT_CAPACITY", defaults.alert_capacity)?,
        })
    }
}
