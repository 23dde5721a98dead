use std::time::Duration;

#[cfg(feature = "config")]
use core_config::{env_bool, env_list, env_parse, ConfigError, FromEnv};

use crate::error::{ResilienceError, ResilienceResult};
use crate::retry::JITTER_RATIO;

/// Watched collections and reconnection policy for change streams
#[derive(Clone, Debug)]
pub struct ChangeStreamConfig {
    /// Collections opened by `initialize()`
    pub collections: Vec<String>,

    /// Reconnect attempts before a stream is marked failed
    pub max_retries: u32,

    pub initial_delay_ms: u64,

    pub max_delay_ms: u64,

    /// Ask the store for the post-image on updates
    pub full_document: bool,

    pub use_jitter: bool,
}

impl ChangeStreamConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = collections.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retries(mut self, max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.initial_delay_ms = initial_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_full_document(mut self, enabled: bool) -> Self {
        self.full_document = enabled;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        if self.initial_delay_ms == 0 {
            return Err(ResilienceError::Config(
                "change stream initial_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ResilienceError::Config(format!(
                "change stream initial_delay_ms ({}) must not exceed max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        if let Some(blank) = self.collections.iter().find(|c| c.trim().is_empty()) {
            return Err(ResilienceError::Config(format!(
                "change stream collection name {blank:?} is blank"
            )));
        }
        Ok(())
    }

    /// Delay before reconnect number `attempts` (0-based):
    /// `min(initial * 2^attempts, max)` plus up to 20% jitter, never above max.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let factor = 1u64 << attempts.min(63);
        let base = self.initial_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        let jitter = if self.use_jitter {
            (base as f64 * JITTER_RATIO * rand::random::<f64>()) as u64
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(jitter).min(self.max_delay_ms))
    }
}

impl Default for ChangeStreamConfig {
    fn default() -> Self {
        Self {
            collections: Vec::new(),
            max_retries: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            full_document: true,
            use_jitter: true,
        }
    }
}

/// Environment variables:
/// - `CHANGE_STREAM_COLLECTIONS` (comma-separated, default: none)
/// - `CHANGE_STREAM_MAX_RETRIES` (default: 5)
/// - `CHANGE_STREAM_INITIAL_DELAY_MS` (default: 1000)
/// - `CHANGE_STREAM_MAX_DELAY_MS` (default: 30000)
/// - `CHANGE_STREAM_FULL_DOCUMENT` (default: true)
#[cfg(feature = "config")]
impl FromEnv for ChangeStreamConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            collections: env_list("CHANGE_STREAM_COLLECTIONS"),
            max_retries: env_parse("CHANGE_STREAM_MAX_RETRIES", defaults.max_retries)?,
            initial_delay_ms: env_parse("CHANGE_STREAM_INITIAL_DELAY_MS", defaults.initial_delay_ms)?,
            max_delay_ms: env_parse("CHANGE_STREAM_MAX_DELAY_MS", defaults.max_delay_ms)?,
            full_document: env_bool("CHANGE_STREAM_FULL_DOCUMENT", defaults.full_document)?,
            use_jitter: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = ChangeStreamConfig::new().with_retries(5, 1000, 5000).without_jitter();
        let delays: Vec<u128> = (0..5).map(|a| config.backoff_delay(a).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = ChangeStreamConfig::new().with_retries(5, 1000, 30_000);
        for attempt in 0..6 {
            let delay = config.backoff_delay(attempt);
            let base = Duration::from_millis((1000u64 << attempt).min(30_000));
            assert!(delay >= base);
            assert!(delay <= base.mul_f64(1.2).min(Duration::from_secs(30)));
        }
    }

    #[test]
    fn test_validate() {
        assert!(ChangeStreamConfig::new().validate().is_ok());
        assert!(ChangeStreamConfig::new().with_retries(3, 0, 10).validate().is_err());
        assert!(ChangeStreamConfig::new().with_retries(3, 500, 10).validate().is_err());
        assert!(ChangeStreamConfig::new().with_collections(["users", " "]).validate().is_err());
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_from_env() {
        temp_env::with_vars(
            [
                ("CHANGE_STREAM_COLLECTIONS", Some("users, notices ,reports")),
                ("CHANGE_STREAM_MAX_RETRIES", Some("8")),
                ("CHANGE_STREAM_FULL_DOCUMENT", Some("false")),
            ],
            || {
                let config = ChangeStreamConfig::from_env().unwrap();
                assert_eq!(config.collections, vec!["users", "notices", "reports"]);
                assert_eq!(config.max_retries, 8);
                assert!(!config.full_document);
            },
        );
    }
}
