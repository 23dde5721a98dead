use std::time::Duration;

use crate::classification::{
    Classification, Classify, DriverError, ErrorCategory, ErrorType, Severity,
};

/// Unified error type surfaced by every resilience component
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    /// Failure reported by the underlying store driver
    #[error("Database error: {0}")]
    Driver(#[from] DriverError),

    /// Operation lost the race against its hard timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Call rejected without running because the breaker is open
    #[error("Circuit breaker '{name}' is open, retry after {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    /// Retry budget spent; carries the last underlying error
    #[error("Operation failed after {attempts} attempts in {elapsed:?}: {source}")]
    RetriesExhausted {
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: Box<ResilienceError>,
    },

    /// No live connection and none requested
    #[error("Not connected to the database")]
    NotConnected,

    /// Connection failed after retries
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Health check failed
    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Change stream setup or persistence failure
    #[error("Change stream error on '{collection}': {message}")]
    ChangeStream { collection: String, message: String },
}

/// Result type alias for resilience operations
pub type ResilienceResult<T> = Result<T, ResilienceError>;

impl ResilienceError {
    /// Classification of this error, unwrapping retry exhaustion to the last cause.
    pub fn classification(&self) -> Classification {
        self.classify()
    }

    /// The innermost error when this is an exhausted retry wrapper.
    pub fn root(&self) -> &ResilienceError {
        match self {
            ResilienceError::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify().retryable
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self.root(), ResilienceError::CircuitOpen { .. })
    }

    /// Attempts recorded by the retry loop, 1 when the error was not retried.
    pub fn attempts(&self) -> u32 {
        match self {
            ResilienceError::RetriesExhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }
}

impl Classify for ResilienceError {
    fn classify(&self) -> Classification {
        use ErrorCategory as C;
        use ErrorType as T;
        use Severity as S;

        match self {
            ResilienceError::Driver(err) => err.classify(),
            ResilienceError::RetriesExhausted { source, .. } => source.classify(),
            ResilienceError::Timeout(after) => Classification::build(
                T::Transient,
                C::Network,
                S::Medium,
                true,
                "OPERATION_TIMEOUT",
                format!("operation exceeded hard timeout of {:?}", after),
            ),
            ResilienceError::CircuitOpen { name, retry_after } => Classification::build(
                T::Transient,
                C::Dependency,
                S::High,
                false,
                "CIRCUIT_OPEN",
                format!("circuit breaker '{}' is open", name),
            )
            .with_retry_after(Some(*retry_after)),
            ResilienceError::NotConnected | ResilienceError::ConnectionFailed(_) => {
                Classification::build(
                    T::Transient,
                    C::Connection,
                    S::High,
                    true,
                    "CONNECTION_LOST",
                    self.to_string(),
                )
            }
            ResilienceError::HealthCheckFailed(_) => Classification::build(
                T::Transient,
                C::Connection,
                S::High,
                true,
                "CONNECTION_LOST",
                self.to_string(),
            ),
            ResilienceError::Config(_) => Classification::build(
                T::Fatal,
                C::Configuration,
                S::Critical,
                false,
                "CONFIGURATION_ERROR",
                self.to_string(),
            ),
            ResilienceError::ChangeStream { .. } => Classification::build(
                T::Persistent,
                C::Dependency,
                S::High,
                false,
                "CHANGE_STREAM_FAILED",
                self.to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_delegates_to_source() {
        let err = ResilienceError::RetriesExhausted {
            attempts: 4,
            elapsed: Duration::from_millis(700),
            source: Box::new(DriverError::command(6, "host unreachable").into()),
        };
        let c = err.classification();
        assert_eq!(c.category, ErrorCategory::Connection);
        assert_eq!(err.attempts(), 4);
        assert!(matches!(err.root(), ResilienceError::Driver(_)));
        assert!(err.to_string().contains("4 attempts"));
    }

    #[test]
    fn test_timeout_has_distinct_code() {
        let c = ResilienceError::Timeout(Duration::from_millis(250)).classification();
        assert_eq!(c.code, "OPERATION_TIMEOUT");
        assert!(c.retryable);
        assert_eq!(c.error_type, ErrorType::Transient);
    }

    #[test]
    fn test_circuit_open_is_not_retryable_but_suggests_wait() {
        let err = ResilienceError::CircuitOpen {
            name: "users".into(),
            retry_after: Duration::from_secs(12),
        };
        let c = err.classification();
        assert!(!c.retryable);
        assert_eq!(c.retry_after, Some(Duration::from_secs(12)));
        assert!(err.is_circuit_open());
    }
}
