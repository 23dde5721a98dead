use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::circuit_breaker::{CircuitBreaker, FailureKind};
use crate::classification::{Classify, ErrorCategory, ErrorType};
use crate::common::as_millis;
use crate::error::{ResilienceError, ResilienceResult};

/// Fraction of the base delay added as random jitter.
pub const JITTER_RATIO: f64 = 0.2;

/// Decides whether `error` on the given (1-based) attempt should be retried.
pub type ShouldRetry = Arc<dyn Fn(&ResilienceError, u32) -> bool + Send + Sync>;

/// Called before sleeping with the error, the attempt that failed and the chosen delay.
pub type OnRetry = Arc<dyn Fn(&ResilienceError, u32, Duration) + Send + Sync>;

/// Retry policy for store operations
#[derive(Clone)]
pub struct RetryOptions {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,

    /// Upper bound for any delay in milliseconds
    pub max_delay_ms: u64,

    /// Add up to 20% random jitter to each delay
    pub use_jitter: bool,

    /// Hard limit per attempt; the attempt future is dropped when it expires
    pub timeout: Option<Duration>,

    /// Custom retry predicate (default: classification says retryable)
    pub should_retry: Option<ShouldRetry>,

    /// Observer invoked before every backoff sleep
    pub on_retry: Option<OnRetry>,
}

impl RetryOptions {
    /// Defaults:
    /// - max_retries: 3
    /// - initial_delay_ms: 100
    /// - max_delay_ms: 5000
    /// - use_jitter: true
    /// - no timeout
    pub fn new() -> Self {
        Self::default()
    }

    /// Build options with explicit bounds, rejecting inconsistent delays.
    pub fn try_new(max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> ResilienceResult<Self> {
        let options = Self {
            max_retries,
            initial_delay_ms,
            max_delay_ms,
            ..Self::default()
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        if self.initial_delay_ms == 0 {
            return Err(ResilienceError::Config(
                "initial_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ResilienceError::Config(format!(
                "initial_delay_ms ({}) must not exceed max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = delay_ms;
        self
    }

    pub fn with_max_delay(mut self, delay_ms: u64) -> Self {
        self.max_delay_ms = delay_ms;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    pub fn with_should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ResilienceError, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub fn with_on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(&ResilienceError, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    /// Delay before retrying after `attempt` failed, without jitter:
    /// `min(initial * 2^(attempt-1), max)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64 << exponent;
        let delay = self.initial_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Delay actually slept: the base delay plus jitter, never above `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = as_millis(self.base_delay(attempt));
        let jitter = if self.use_jitter {
            (base as f64 * JITTER_RATIO * rand::random::<f64>()) as u64
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(jitter).min(self.max_delay_ms))
    }

    fn should_retry(&self, error: &ResilienceError, attempt: u32) -> bool {
        match &self.should_retry {
            Some(predicate) => predicate(error, attempt),
            None => error.classify().retryable,
        }
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            use_jitter: true,
            timeout: None,
            should_retry: None,
            on_retry: None,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("initial_delay_ms", &self.initial_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("use_jitter", &self.use_jitter)
            .field("timeout", &self.timeout)
            .field("should_retry", &self.should_retry.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

/// Backoff-driven retry loop.
///
/// Holds no state between runs, so one executor can be shared by any number
/// of concurrent callers.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    options: RetryOptions,
}

impl RetryExecutor {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the retry budget is spent.
    ///
    /// Non-retryable errors are returned unchanged. Exhaustion wraps the last
    /// error in [`ResilienceError::RetriesExhausted`].
    ///
    /// # Example
    /// ```ignore
    /// use db_resilience::retry::{RetryExecutor, RetryOptions};
    ///
    /// let executor = RetryExecutor::new(RetryOptions::new().with_max_retries(5));
    /// let doc = executor.run(|| async { collection.find_one(filter.clone()).await }).await?;
    /// ```
    pub async fn run<F, Fut, T, E>(&self, mut operation: F) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        self.run_attempts(|| attempt_with_timeout(operation(), self.options.timeout))
            .await
    }

    /// Same as [`run`](Self::run), with every attempt passing through `breaker`.
    ///
    /// Once the breaker opens, the next attempt is rejected and the rejection
    /// is returned immediately.
    pub async fn run_with_breaker<F, Fut, T, E>(
        &self,
        breaker: &CircuitBreaker,
        operation: F,
    ) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        let timeout = self.options.timeout;
        let mut operation = operation;
        self.run_attempts(move || {
            let attempt = attempt_with_timeout(operation(), timeout);
            breaker.call_with(move || attempt, breaker_accounting)
        })
        .await
    }

    async fn run_attempts<F, Fut, T>(&self, mut attempt_fn: F) -> ResilienceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let err = match attempt_fn().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after {} retries", attempt - 1);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !self.options.should_retry(&err, attempt) {
                debug!(attempt, error = %err, "Operation failed with non-retryable error");
                return Err(err);
            }

            if attempt > self.options.max_retries {
                let elapsed = started.elapsed();
                error!(
                    attempts = attempt,
                    elapsed_ms = as_millis(elapsed),
                    error = %err,
                    "Operation failed, retries exhausted"
                );
                return Err(ResilienceError::RetriesExhausted {
                    attempts: attempt,
                    elapsed,
                    source: Box::new(err),
                });
            }

            let delay = self.options.delay_for(attempt);
            if let Some(observer) = &self.options.on_retry {
                observer(&err, attempt, delay);
            }

            warn!(
                attempt,
                max_retries = self.options.max_retries,
                backoff_ms = as_millis(delay),
                error = %err,
                "Operation failed, retrying"
            );

            tokio::time::sleep(delay).await;
        }
    }
}

/// Run an operation with the given options.
pub async fn with_retry<F, Fut, T, E>(options: RetryOptions, operation: F) -> ResilienceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<ResilienceError>,
{
    RetryExecutor::new(options).run(operation).await
}

/// How a classified error counts against a circuit breaker.
///
/// Request-shaped failures (bad input, validation) say nothing about the
/// store's health and are ignored; fatal errors open the breaker at once.
pub fn breaker_accounting(error: &ResilienceError) -> FailureKind {
    if error.is_circuit_open() {
        return FailureKind::Ignored;
    }

    let classification = error.classify();
    match (classification.error_type, classification.category) {
        (ErrorType::Fatal, _) => FailureKind::Fatal,
        (ErrorType::Persistent, ErrorCategory::Input | ErrorCategory::Validation) => {
            FailureKind::Ignored
        }
        _ => FailureKind::Counted,
    }
}

async fn attempt_with_timeout<Fut, T, E>(future: Fut, timeout: Option<Duration>) -> ResilienceResult<T>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<ResilienceError>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, future).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(ResilienceError::Timeout(limit)),
        },
        None => future.await.map_err(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::classification::DriverError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> ResilienceError {
        DriverError::command(6, "host unreachable").into()
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_max_retries_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryOptions::new().with_max_retries(3).without_jitter());

        let c = counter.clone();
        let result = executor
            .run(|| {
                let counter = c.clone();
                async move {
                    let count = counter.fetch_add(1, Ordering::SeqCst);
                    if count < 3 { Err(transient()) } else { Ok("success") }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(
            RetryOptions::new()
                .with_max_retries(2)
                .with_initial_delay(10)
                .without_jitter(),
        );

        let c = counter.clone();
        let err = executor
            .run(|| {
                let counter = c.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(transient())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 3); // 1 initial + 2 retries
        match err {
            ResilienceError::RetriesExhausted { attempts, elapsed, source } => {
                assert_eq!(attempts, 3);
                assert!(elapsed >= Duration::from_millis(30));
                assert!(matches!(*source, ResilienceError::Driver(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_returned_unchanged() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let err = with_retry(RetryOptions::new(), || {
            let counter = c.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(DriverError::command(11000, "E11000 duplicate key"))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ResilienceError::Driver(ref d) if d.code == Some(11000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_base_delays_double_and_cap() {
        let options = RetryOptions::new()
            .with_initial_delay(100)
            .with_max_delay(1000)
            .without_jitter();
        let delays: Vec<u64> = (1..=5).map(|a| as_millis(options.base_delay(a))).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observed_delays_are_non_decreasing_and_bounded() {
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        let options = RetryOptions::new()
            .with_max_retries(6)
            .with_initial_delay(100)
            .with_max_delay(1000)
            .with_on_retry(move |_, _, delay| sink.lock().unwrap().push(delay));

        let _ = RetryExecutor::new(options)
            .run(|| async { Err::<(), _>(transient()) })
            .await;

        let delays = observed.lock().unwrap().clone();
        assert_eq!(delays.len(), 6);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(1000)));
        assert!(delays[0] >= Duration::from_millis(100) && delays[0] <= Duration::from_millis(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_classified_and_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let err = RetryExecutor::new(
            RetryOptions::new()
                .with_max_retries(1)
                .with_timeout(Duration::from_millis(50))
                .without_jitter(),
        )
        .run(|| {
            let counter = c.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, ResilienceError>(())
            }
        })
        .await
        .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(matches!(err.root(), ResilienceError::Timeout(_)));
        assert_eq!(err.classification().code, "OPERATION_TIMEOUT");
    }

    #[tokio::test]
    async fn test_custom_predicate_overrides_classification() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let _ = RetryExecutor::new(
            RetryOptions::new()
                .with_max_retries(5)
                .with_initial_delay(1)
                .with_should_retry(|_, attempt| attempt < 2),
        )
        .run(|| {
            let counter = c.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(transient())
            }
        })
        .await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_stops_retry_loop_once_open() {
        let breaker = CircuitBreaker::new("t", CircuitBreakerConfig::new().with_failure_threshold(2));
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let err = RetryExecutor::new(RetryOptions::new().with_max_retries(5).without_jitter())
            .run_with_breaker(&breaker, || {
                let counter = c.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(transient())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(err.is_circuit_open());
    }

    #[test]
    fn test_validation_rejects_bad_bounds() {
        assert!(RetryOptions::try_new(3, 0, 100).is_err());
        assert!(RetryOptions::try_new(3, 500, 100).is_err());
        assert!(RetryOptions::try_new(3, 100, 100).is_ok());
    }

    #[test]
    fn test_breaker_accounting() {
        assert_eq!(breaker_accounting(&transient()), FailureKind::Counted);
        assert_eq!(
            breaker_accounting(&DriverError::command(11000, "dup").into()),
            FailureKind::Ignored
        );
        assert_eq!(
            breaker_accounting(&DriverError::command(18, "auth").into()),
            FailureKind::Fatal
        );
    }
}
