use core_config::{env_parse, server::ServerConfig, FromEnv};
use db_resilience::ResilienceConfig;
use std::time::Duration;

pub use core_config::Environment;

/// Gateway configuration
/// Composes the resilience stack with the shared server settings
#[derive(Clone, Debug)]
pub struct Config {
    pub resilience: ResilienceConfig,
    pub server: ServerConfig,
    pub environment: Environment,
    /// Upper bound for closing streams and the pool on shutdown
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn from_env() -> eyre::Result<Self> {
        let environment = Environment::from_env();
        let resilience = ResilienceConfig::from_env()?;
        let server = ServerConfig::from_env()?;
        let shutdown_timeout = Duration::from_secs(env_parse("SHUTDOWN_TIMEOUT_SECS", 30u64)?);

        Ok(Self {
            resilience,
            server,
            environment,
            shutdown_timeout,
        })
    }
}
