//! Connection health monitoring, alert history and the HTTP health surface.

pub mod config;
pub mod monitor;
pub mod service;

#[cfg(feature = "http")]
pub mod routes;

pub use config::{HealthMonitorConfig, HealthServiceConfig};
pub use monitor::{
    ConnectionHealthMonitor, HealthEvent, HealthState, MonitorSnapshot, ProbeResult, RecoveryState,
};
pub use service::{Alert, DetailedHealthMetrics, HealthCheckService, HealthMetrics, StatusChange};

#[cfg(feature = "http")]
pub use routes::{health_router, HealthRouterState};
