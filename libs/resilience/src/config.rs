//! Aggregate configuration for a full resilience stack.

use crate::change_stream::ChangeStreamConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::connection::ConnectionConfig;
use crate::health::{HealthMonitorConfig, HealthServiceConfig};
use crate::metrics::MetricsConfig;

#[cfg(feature = "config")]
use core_config::{ConfigError, FromEnv};

#[cfg(feature = "mongodb")]
use crate::mongodb::MongoConfig;

/// Every component's settings in one place.
///
/// Breakers have no environment keys; they are tuned in code.
#[derive(Clone, Debug, Default)]
pub struct ResilienceConfig {
    #[cfg(feature = "mongodb")]
    pub mongo: MongoConfig,
    pub connection: ConnectionConfig,
    pub breaker: CircuitBreakerConfig,
    pub monitor: HealthMonitorConfig,
    pub health: HealthServiceConfig,
    pub change_streams: ChangeStreamConfig,
    pub metrics: MetricsConfig,
}

impl ResilienceConfig {
    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }
}

#[cfg(feature = "config")]
impl FromEnv for ResilienceConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            #[cfg(feature = "mongodb")]
            mongo: MongoConfig::from_env()?,
            connection: ConnectionConfig::from_env()?,
            breaker: CircuitBreakerConfig::default(),
            monitor: HealthMonitorConfig::from_env()?,
            health: HealthServiceConfig::from_env()?,
            change_streams: ChangeStreamConfig::from_env()?,
            metrics: MetricsConfig::from_env()?,
        })
    }
}
