use std::time::Duration;

#[cfg(feature = "config")]
use core_config::{env_parse, env_parse_opt, ConfigError, FromEnv};

use crate::error::ResilienceResult;
use crate::retry::RetryOptions;

/// Retry and sampling policy for the connection manager
///
/// Connection attempts and individual operations have separate budgets:
/// connecting waits longer between attempts, operations fail faster.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Retries after the first connection attempt
    pub connect_max_retries: u32,
    pub connect_initial_delay_ms: u64,
    pub connect_max_delay_ms: u64,

    /// Retries after the first attempt of an operation
    pub operation_max_retries: u32,
    pub operation_initial_delay_ms: u64,
    pub operation_max_delay_ms: u64,

    /// Hard per-attempt limit for operations (none by default)
    pub operation_timeout: Option<Duration>,

    /// Latency samples kept per operation kind
    pub latency_samples: usize,
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_retries(mut self, max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.connect_max_retries = max_retries;
        self.connect_initial_delay_ms = initial_delay_ms;
        self.connect_max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_operation_retries(mut self, max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.operation_max_retries = max_retries;
        self.operation_initial_delay_ms = initial_delay_ms;
        self.operation_max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn with_latency_samples(mut self, samples: usize) -> Self {
        self.latency_samples = samples;
        self
    }

    pub fn connect_retry_options(&self) -> ResilienceResult<RetryOptions> {
        let options = RetryOptions::try_new(
            self.connect_max_retries,
            self.connect_initial_delay_ms,
            self.connect_max_delay_ms,
        )?;
        Ok(options)
    }

    pub fn operation_retry_options(&self) -> ResilienceResult<RetryOptions> {
        let mut options = RetryOptions::try_new(
            self.operation_max_retries,
            self.operation_initial_delay_ms,
            self.operation_max_delay_ms,
        )?;
        options.timeout = self.operation_timeout;
        Ok(options)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_max_retries: 5,
            connect_initial_delay_ms: 1000,
            connect_max_delay_ms: 30_000,
            operation_max_retries: 3,
            operation_initial_delay_ms: 100,
            operation_max_delay_ms: 5000,
            operation_timeout: None,
            latency_samples: 100,
        }
    }
}

/// Environment variables:
/// - `DB_CONNECT_MAX_RETRIES` (default: 5)
/// - `DB_CONNECT_INITIAL_DELAY_MS` (default: 1000)
/// - `DB_CONNECT_MAX_DELAY_MS` (default: 30000)
/// - `DB_OPERATION_MAX_RETRIES` (default: 3)
/// - `DB_OPERATION_INITIAL_DELAY_MS` (default: 100)
/// - `DB_OPERATION_MAX_DELAY_MS` (default: 5000)
/// - `DB_OPERATION_TIMEOUT_MS` (optional)
/// - `DB_LATENCY_SAMPLES` (default: 100)
#[cfg(feature = "config")]
impl FromEnv for ConnectionConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            connect_max_retries: env_parse("DB_CONNECT_MAX_RETRIES", defaults.connect_max_retries)?,
            connect_initial_delay_ms: env_parse(
                "DB_CONNECT_INITIAL_DELAY_MS",
                defaults.connect_initial_delay_ms,
            )?,
            connect_max_delay_ms: env_parse("DB_CONNECT_MAX_DELAY_MS", defaults.connect_max_delay_ms)?,
            operation_max_retries: env_parse(
                "DB_OPERATION_MAX_RETRIES",
                defaults.operation_max_retries,
            )?,
            operation_initial_delay_ms: env_parse(
                "DB_OPERATION_INITIAL_DELAY_MS",
                defaults.operation_initial_delay_ms,
            )?,
            operation_max_delay_ms: env_parse(
                "DB_OPERATION_MAX_DELAY_MS",
                defaults.operation_max_delay_ms,
            )?,
            operation_timeout: env_parse_opt::<u64>("DB_OPERATION_TIMEOUT_MS")?
                .map(Duration::from_millis),
            latency_samples: env_parse("DB_LATENCY_SAMPLES", defaults.latency_samples)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_options() {
        let config = ConnectionConfig::default();
        let connect = config.connect_retry_options().unwrap();
        assert_eq!(connect.max_retries, 5);
        assert_eq!(connect.initial_delay_ms, 1000);

        let ops = config.operation_retry_options().unwrap();
        assert_eq!(ops.max_retries, 3);
        assert_eq!(ops.timeout, None);
    }

    #[test]
    fn test_invalid_bounds_are_rejected() {
        let config = ConnectionConfig::new().with_operation_retries(3, 900, 100);
        assert!(config.operation_retry_options().is_err());
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_from_env() {
        temp_env::with_vars(
            [
                ("DB_CONNECT_MAX_RETRIES", Some("2")),
                ("DB_OPERATION_TIMEOUT_MS", Some("750")),
                ("DB_LATENCY_SAMPLES", None),
            ],
            || {
                let config = ConnectionConfig::from_env().unwrap();
                assert_eq!(config.connect_max_retries, 2);
                assert_eq!(config.operation_timeout, Some(Duration::from_millis(750)));
                assert_eq!(config.latency_samples, 100);
            },
        );
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_from_env_rejects_garbage() {
        temp_env::with_var("DB_OPERATION_MAX_RETRIES", Some("lots"), || {
            assert!(ConnectionConfig::from_env().is_err());
        });
    }
}
