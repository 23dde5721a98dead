//! Circuit breaker for store operations.
//!
//! ## States
//!
//! ```text
//! ┌─────────┐  failures >= threshold  ┌────────┐
//! │ CLOSED  │ ──────────────────────> │  OPEN  │ <────────┐
//! └─────────┘                         └────────┘          │
//!      ^                                   │              │
//!      │                                   │ reset_timeout│
//!      │                                   │ elapsed and  │
//!      │                                   v a call comes │
//!      │   successes >= threshold  ┌─────────────┐  any   │
//!      └────────────────────────── │  HALF_OPEN  │ ───────┘
//!                                  └─────────────┘ failure
//! ```
//!
//! All counters and the state live behind one mutex so that concurrent
//! completions serialize their transitions. Every transition is kept in a
//! bounded history and broadcast as a `state_change` event.
//!
//! ## Example
//!
//! ```rust,ignore
//! use db_resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("users", CircuitBreakerConfig::new().with_failure_threshold(3));
//! let user = breaker.call(|| async { repo.find_user(id).await }).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use strum::{AsRefStr, Display};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::common::{as_millis, RingBuffer};
use crate::error::ResilienceError;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the reset timeout elapses
    Open,
    /// Trial calls decide whether the dependency recovered
    HalfOpen,
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED before opening.
    pub failure_threshold: u32,
    /// How long OPEN rejects calls before a trial is allowed.
    pub reset_timeout: Duration,
    /// Successes required in HALF_OPEN before closing.
    pub half_open_success_threshold: u32,
    /// Number of transitions kept in the history.
    pub history_capacity: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_success_threshold: 2,
            history_capacity: 50,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_half_open_success_threshold(mut self, threshold: u32) -> Self {
        self.half_open_success_threshold = threshold.max(1);
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// `state_change` event published on every transition.
#[derive(Debug, Clone)]
pub struct CircuitEvent {
    pub breaker: String,
    pub transition: StateTransition,
}

impl CircuitEvent {
    pub fn name(&self) -> &'static str {
        "state_change"
    }
}

/// Returned instead of running the operation while the breaker is open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker '{name}' is open")]
pub struct CircuitOpenError {
    pub name: String,
    pub retry_after: Duration,
}

impl From<CircuitOpenError> for ResilienceError {
    fn from(err: CircuitOpenError) -> Self {
        ResilienceError::CircuitOpen {
            name: err.name,
            retry_after: err.retry_after,
        }
    }
}

/// How a failed call should be accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The dependency answered; the failure is about the request itself
    Ignored,
    /// Counts toward the failure threshold
    Counted,
    /// Opens the breaker immediately
    Fatal,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub history: Vec<StateTransition>,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt: Option<Instant>,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    rejected: u64,
    history: RingBuffer<StateTransition>,
}

/// Thread-safe circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    events: broadcast::Sender<CircuitEvent>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self::with_events(name, config, events)
    }

    /// Create a breaker that publishes onto an existing channel.
    pub fn with_events(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        events: broadcast::Sender<CircuitEvent>,
    ) -> Self {
        let history = RingBuffer::new(config.history_capacity);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                next_attempt: None,
                total_calls: 0,
                total_successes: 0,
                total_failures: 0,
                rejected: 0,
                history,
            }),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.lock().success_count
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    /// Run `operation` through the breaker; every error counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.call_with(operation, |_| FailureKind::Counted).await
    }

    /// Run `operation`, letting `judge` decide how each error is accounted.
    pub async fn call_with<F, Fut, T, E, J>(&self, operation: F, judge: J) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
        J: FnOnce(&E) -> FailureKind,
    {
        self.try_acquire()?;

        let result = operation().await;
        self.account(&result, judge);
        result
    }

    /// Like [`call_with`](Self::call_with), but a rejected call runs
    /// `fallback` instead.
    pub async fn call_or_else<F, Fut, J, G, GFut, T, E>(&self, operation: F, judge: J, fallback: G) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        J: FnOnce(&E) -> FailureKind,
        G: FnOnce(CircuitOpenError) -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        if let Err(open) = self.try_acquire() {
            return fallback(open).await;
        }

        let result = operation().await;
        self.account(&result, judge);
        result
    }

    fn account<T, E, J>(&self, result: &Result<T, E>, judge: J)
    where
        J: FnOnce(&E) -> FailureKind,
    {
        match result {
            Ok(_) => self.record_success(),
            Err(err) => match judge(err) {
                FailureKind::Ignored => {}
                FailureKind::Counted => self.record_failure(),
                FailureKind::Fatal => self.trip("fatal error"),
            },
        }
    }

    /// Admission check. Moves OPEN to HALF_OPEN once the reset timeout passed.
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                inner.total_calls += 1;
                Ok(())
            }
            CircuitState::Open => {
                let now = Instant::now();
                match inner.next_attempt {
                    Some(at) if now < at => {
                        inner.rejected += 1;
                        Err(CircuitOpenError {
                            name: self.name.clone(),
                            retry_after: at - now,
                        })
                    }
                    _ => {
                        self.transition(&mut inner, CircuitState::HalfOpen, "reset timeout elapsed");
                        inner.total_calls += 1;
                        Ok(())
                    }
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_success_threshold {
                    self.transition(&mut inner, CircuitState::Closed, "trial calls succeeded");
                }
            }
            // Late completion of a call admitted before the breaker opened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open, "failure threshold reached");
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open, "trial call failed");
            }
            CircuitState::Open => {}
        }
    }

    /// Open immediately, regardless of counters.
    pub fn trip(&self, reason: &str) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        if inner.state == CircuitState::Open {
            inner.next_attempt = Some(Instant::now() + self.config.reset_timeout);
        } else {
            self.transition(&mut inner, CircuitState::Open, reason);
        }
    }

    /// Administrative override.
    pub fn force_state(&self, state: CircuitState) {
        let mut inner = self.lock();
        if inner.state != state {
            self.transition(&mut inner, state, "forced");
        }
    }

    /// Back to CLOSED with all counters cleared.
    pub fn reset(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, "manual reset");
        }
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.next_attempt = None;
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let retry_after_ms = match (inner.state, inner.next_attempt) {
            (CircuitState::Open, Some(at)) => {
                Some(as_millis(at.saturating_duration_since(Instant::now())))
            }
            _ => None,
        };

        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_calls: inner.total_calls,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected: inner.rejected,
            retry_after_ms,
            history: inner.history.to_vec(),
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState, reason: &str) {
        let from = inner.state;
        inner.state = to;
        inner.success_count = 0;

        match to {
            CircuitState::Open => {
                inner.next_attempt = Some(Instant::now() + self.config.reset_timeout);
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    reset_timeout_ms = as_millis(self.config.reset_timeout),
                    "Circuit breaker OPENED: {}", reason
                );
            }
            CircuitState::HalfOpen => {
                inner.failure_count = 0;
                info!(breaker = %self.name, "Circuit breaker HALF_OPEN (testing recovery)");
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.next_attempt = None;
                info!(breaker = %self.name, "Circuit breaker CLOSED: {}", reason);
            }
        }

        let transition = StateTransition {
            from,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        };
        inner.history.push(transition.clone());

        // No subscribers is fine
        let _ = self.events.send(CircuitEvent {
            breaker: self.name.clone(),
            transition,
        });
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One breaker per logical resource, all publishing onto one channel.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    events: broadcast::Sender<CircuitEvent>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Breaker for `name`, created with the registry defaults on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.config.clone())
    }

    /// Breaker for `name`; `config` applies only if it does not exist yet.
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::with_events(name, config, self.events.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers.get(name).cloned()
    }

    /// Reset every breaker, returning how many there were.
    pub fn reset_all(&self) -> usize {
        let breakers: Vec<_> = {
            let map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        for breaker in &breakers {
            breaker.reset();
        }
        info!(count = breakers.len(), "All circuit breakers reset");
        breakers.len()
    }

    /// Snapshots sorted by name.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<_> = {
            let map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
