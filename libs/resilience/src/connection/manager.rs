use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::config::ConnectionConfig;
use super::connector::{DriverSignal, StoreConnector};
use super::stats::{ConnectionStats, LatencySummary, OperationCounters, OperationKind, ReadyState};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry};
use crate::classification::{Classification, Classify};
use crate::common::{as_millis, RingBuffer};
use crate::error::{ResilienceError, ResilienceResult};
use crate::retry::{RetryExecutor, RetryOptions};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Observable connection lifecycle and operation outcomes.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String },
    Error { classification: Classification, message: String },
    Reconnected,
    OperationCompleted {
        kind: OperationKind,
        success: bool,
        duration: Duration,
        retries: u32,
    },
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Connected => "connected",
            ConnectionEvent::Disconnected { .. } => "disconnected",
            ConnectionEvent::Error { .. } => "error",
            ConnectionEvent::Reconnected => "reconnected",
            ConnectionEvent::OperationCompleted { .. } => "operation_completed",
        }
    }
}

/// Object-safe view of a connection manager for the monitor and health surface.
#[async_trait]
pub trait ManagedConnection: Send + Sync {
    /// Round-trip latency of a ping.
    async fn ping(&self) -> ResilienceResult<Duration>;

    /// Tear down and re-open the pool.
    async fn reconnect(&self) -> ResilienceResult<()>;

    fn stats(&self) -> ConnectionStats;

    fn is_connected(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;
}

struct ManagerState {
    ready_state: ReadyState,
    counters: HashMap<OperationKind, OperationCounters>,
    latencies: HashMap<OperationKind, RingBuffer<u64>>,
    overall_latency: RingBuffer<u64>,
    failure_count: u64,
    reconnect_count: u64,
    last_error: Option<String>,
    connected_since: Option<DateTime<Utc>>,
}

struct Inner<C: StoreConnector> {
    connector: Arc<C>,
    config: ConnectionConfig,
    client: RwLock<Option<C::Client>>,
    connected: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
    completed_attempts: AtomicU64,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<ConnectionEvent>,
    signal_task: Mutex<Option<JoinHandle<()>>>,
    breakers: Arc<CircuitBreakerRegistry>,
}

/// Owner of the single shared connection pool.
///
/// Cloning is cheap and every clone shares the same pool, counters and
/// event channel. Inject one instance into every dependent.
pub struct ConnectionManager<C: StoreConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: StoreConnector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: StoreConnector> ConnectionManager<C> {
    pub fn new(connector: C, config: ConnectionConfig) -> Self {
        Self::with_breakers(connector, config, Arc::new(CircuitBreakerRegistry::default()))
    }

    /// Manager whose guarded operations use breakers from `breakers`.
    pub fn with_breakers(
        connector: C,
        config: ConnectionConfig,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let samples = config.latency_samples;

        Self {
            inner: Arc::new(Inner {
                connector: Arc::new(connector),
                config,
                client: RwLock::new(None),
                connected: AtomicBool::new(false),
                connect_lock: tokio::sync::Mutex::new(()),
                completed_attempts: AtomicU64::new(0),
                state: Mutex::new(ManagerState {
                    ready_state: ReadyState::Disconnected,
                    counters: HashMap::new(),
                    latencies: HashMap::new(),
                    overall_latency: RingBuffer::new(samples),
                    failure_count: 0,
                    reconnect_count: 0,
                    last_error: None,
                    connected_since: None,
                }),
                events,
                signal_task: Mutex::new(None),
                breakers,
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.inner.breakers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// The pool handle, if a connection was established.
    pub fn client(&self) -> Option<C::Client> {
        self.inner
            .client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Open the pool, retrying with backoff up to the configured ceiling.
    ///
    /// Idempotent: returns the existing client when already connected.
    /// Concurrent callers wait for the in-flight attempt and share its
    /// outcome instead of starting their own.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> ResilienceResult<C::Client> {
        if let Some(client) = self.client() {
            return Ok(client);
        }

        let seen = self.inner.completed_attempts.load(Ordering::SeqCst);
        let _guard = self.inner.connect_lock.lock().await;

        if let Some(client) = self.client() {
            return Ok(client);
        }
        if self.inner.completed_attempts.load(Ordering::SeqCst) != seen {
            let reason = self
                .lock_state()
                .last_error
                .clone()
                .unwrap_or_else(|| "connection attempt failed".to_string());
            return Err(ResilienceError::ConnectionFailed(reason));
        }

        let options = self.inner.config.connect_retry_options()?;
        self.lock_state().ready_state = ReadyState::Connecting;
        info!(
            max_retries = options.max_retries,
            "Connecting to the database"
        );

        let connector = self.inner.connector.clone();
        let result = RetryExecutor::new(options)
            .run(|| {
                let connector = connector.clone();
                async move { connector.connect().await }
            })
            .await;
        self.inner.completed_attempts.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(client) => {
                *self.inner.client.write().unwrap_or_else(|e| e.into_inner()) = Some(client.clone());
                self.inner.connected.store(true, Ordering::SeqCst);
                {
                    let mut state = self.lock_state();
                    state.ready_state = ReadyState::Connected;
                    state.connected_since = Some(Utc::now());
                    state.last_error = None;
                }
                self.spawn_signal_listener();
                info!("Connected to the database");
                self.emit(ConnectionEvent::Connected);
                Ok(client)
            }
            Err(err) => {
                let classification = err.classify();
                {
                    let mut state = self.lock_state();
                    state.ready_state = ReadyState::Disconnected;
                    state.failure_count += 1;
                    state.last_error = Some(err.to_string());
                }
                error!(
                    error = %err,
                    category = %classification.category,
                    attempts = err.attempts(),
                    "Failed to connect to the database"
                );
                self.emit(ConnectionEvent::Error {
                    classification,
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Release the pool. A no-op when not connected.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        let _guard = self.inner.connect_lock.lock().await;

        if let Some(handle) = self.signal_slot().take() {
            handle.abort();
        }

        let client = self.inner.client.write().unwrap_or_else(|e| e.into_inner()).take();
        let Some(client) = client else {
            return;
        };

        self.lock_state().ready_state = ReadyState::Disconnecting;
        info!("Disconnecting from the database");

        self.inner.connector.shutdown(client).await;
        self.inner.connected.store(false, Ordering::SeqCst);
        {
            let mut state = self.lock_state();
            state.ready_state = ReadyState::Disconnected;
            state.connected_since = None;
        }

        info!("Database connection closed");
        self.emit(ConnectionEvent::Disconnected {
            reason: "requested".to_string(),
        });
    }

    /// Drop the current pool and open a new one.
    pub async fn reconnect(&self) -> ResilienceResult<()> {
        warn!("Reconnecting to the database");
        self.disconnect().await;
        self.connect().await?;

        self.lock_state().reconnect_count += 1;
        self.emit(ConnectionEvent::Reconnected);
        Ok(())
    }

    /// Round-trip probe, returning its latency.
    pub async fn ping(&self) -> ResilienceResult<Duration> {
        let client = self.client().ok_or(ResilienceError::NotConnected)?;
        let started = Instant::now();
        self.inner.connector.ping(&client).await?;
        Ok(started.elapsed())
    }

    /// Run `operation` against the pool with the configured operation retry policy.
    ///
    /// Retry decisions follow the error classification; counters and latency
    /// are recorded under `kind`.
    ///
    /// # Example
    /// ```ignore
    /// let user = manager
    ///     .execute_with_retry(OperationKind::Find, |client| {
    ///         let users = client.database("app").collection::<User>("users");
    ///         async move { users.find_one(doc! { "_id": id }).await }
    ///     })
    ///     .await?;
    /// ```
    pub async fn execute_with_retry<F, Fut, T, E>(&self, kind: OperationKind, operation: F) -> ResilienceResult<T>
    where
        F: FnMut(C::Client) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        let options = self.inner.config.operation_retry_options()?;
        self.execute(kind, options, None, operation).await
    }

    /// Like [`execute_with_retry`](Self::execute_with_retry) with explicit retry options.
    pub async fn execute_with_options<F, Fut, T, E>(
        &self,
        kind: OperationKind,
        options: RetryOptions,
        operation: F,
    ) -> ResilienceResult<T>
    where
        F: FnMut(C::Client) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        options.validate()?;
        self.execute(kind, options, None, operation).await
    }

    /// Retry plus the circuit breaker registered for `resource`.
    ///
    /// Input and validation failures do not count against the breaker;
    /// fatal errors open it immediately.
    pub async fn execute_guarded<F, Fut, T, E>(
        &self,
        resource: &str,
        kind: OperationKind,
        operation: F,
    ) -> ResilienceResult<T>
    where
        F: FnMut(C::Client) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        let options = self.inner.config.operation_retry_options()?;
        let breaker = self.inner.breakers.get_or_create(resource);
        self.execute(kind, options, Some(breaker), operation).await
    }

    async fn execute<F, Fut, T, E>(
        &self,
        kind: OperationKind,
        mut options: RetryOptions,
        breaker: Option<Arc<CircuitBreaker>>,
        mut operation: F,
    ) -> ResilienceResult<T>
    where
        F: FnMut(C::Client) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ResilienceError>,
    {
        let retries = Arc::new(AtomicU32::new(0));
        let retry_counter = retries.clone();
        let user_hook = options.on_retry.take();
        options.on_retry = Some(Arc::new(move |err: &ResilienceError, attempt: u32, delay: Duration| {
            retry_counter.fetch_add(1, Ordering::Relaxed);
            if let Some(hook) = &user_hook {
                hook(err, attempt, delay);
            }
        }));

        let executor = RetryExecutor::new(options);
        let started = Instant::now();

        let result = match &breaker {
            Some(breaker) => {
                executor
                    .run_with_breaker(breaker, || bind_client(self.client().map(&mut operation)))
                    .await
            }
            None => {
                executor
                    .run(|| bind_client(self.client().map(&mut operation)))
                    .await
            }
        };

        let duration = started.elapsed();
        let retries = retries.load(Ordering::Relaxed);
        self.record_operation(kind, result.is_ok(), duration, retries);

        if let Err(err) = &result {
            let classification = err.classify();
            {
                let mut state = self.lock_state();
                state.failure_count += 1;
                state.last_error = Some(err.to_string());
            }
            warn!(
                kind = %kind,
                code = %classification.code,
                retries,
                error = %err,
                "Database operation failed"
            );
            self.emit(ConnectionEvent::Error {
                classification,
                message: err.to_string(),
            });
        }

        result
    }

    /// Apply a driver signal to the connection state and republish it.
    pub fn handle_signal(&self, signal: DriverSignal) {
        match signal {
            DriverSignal::Disconnected { reason } => {
                let was_connected = self.inner.connected.swap(false, Ordering::SeqCst);
                self.lock_state().ready_state = ReadyState::Disconnected;
                if was_connected {
                    warn!(reason = %reason, "Lost connection to the database");
                    self.emit(ConnectionEvent::Disconnected { reason });
                }
            }
            DriverSignal::Reconnected => {
                let was_connected = self.inner.connected.swap(true, Ordering::SeqCst);
                if !was_connected && self.client().is_some() {
                    {
                        let mut state = self.lock_state();
                        state.ready_state = ReadyState::Connected;
                        state.reconnect_count += 1;
                        state.connected_since = Some(Utc::now());
                    }
                    info!("Database connection restored");
                    self.emit(ConnectionEvent::Reconnected);
                }
            }
            DriverSignal::Error(err) => {
                let classification = err.classify();
                {
                    let mut state = self.lock_state();
                    state.failure_count += 1;
                    state.last_error = Some(err.to_string());
                }
                warn!(error = %err, "Database driver reported an error");
                self.emit(ConnectionEvent::Error {
                    classification,
                    message: err.to_string(),
                });
            }
        }
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> ConnectionStats {
        let pool = self.inner.connector.pool_usage();
        let state = self.lock_state();

        let operations = state
            .counters
            .iter()
            .map(|(kind, counters)| {
                let mut counters = *counters;
                if let Some(samples) = state.latencies.get(kind) {
                    counters.avg_latency_ms = LatencySummary::from_samples(samples).avg_ms;
                }
                (*kind, counters)
            })
            .collect();

        ConnectionStats {
            is_connected: self.is_connected(),
            ready_state: state.ready_state,
            operations,
            failure_count: state.failure_count,
            reconnect_count: state.reconnect_count,
            latency: LatencySummary::from_samples(&state.overall_latency),
            pool,
            last_error: state.last_error.clone(),
            connected_since: state.connected_since,
        }
    }

    fn record_operation(&self, kind: OperationKind, success: bool, duration: Duration, retries: u32) {
        let millis = as_millis(duration);
        {
            let mut state = self.lock_state();
            let samples = self.inner.config.latency_samples;

            let counters = state.counters.entry(kind).or_default();
            counters.total += 1;
            counters.retried += u64::from(retries);
            if success {
                counters.succeeded += 1;
            } else {
                counters.failed += 1;
            }

            state
                .latencies
                .entry(kind)
                .or_insert_with(|| RingBuffer::new(samples))
                .push(millis);
            state.overall_latency.push(millis);
        }

        debug!(kind = %kind, success, latency_ms = millis, retries, "Database operation completed");
        self.emit(ConnectionEvent::OperationCompleted {
            kind,
            success,
            duration,
            retries,
        });
    }

    fn spawn_signal_listener(&self) {
        let Some(mut signals) = self.inner.connector.signals() else {
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(signal) => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        ConnectionManager { inner }.handle_signal(signal);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Driver signal listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.signal_slot().replace(handle) {
            previous.abort();
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn signal_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.signal_task.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl<C: StoreConnector> ManagedConnection for ConnectionManager<C> {
    async fn ping(&self) -> ResilienceResult<Duration> {
        ConnectionManager::ping(self).await
    }

    async fn reconnect(&self) -> ResilienceResult<()> {
        ConnectionManager::reconnect(self).await
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionManager::stats(self)
    }

    fn is_connected(&self) -> bool {
        ConnectionManager::is_connected(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        ConnectionManager::subscribe(self)
    }
}

async fn bind_client<Fut, T, E>(attempt: Option<Fut>) -> ResilienceResult<T>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<ResilienceError>,
{
    match attempt {
        Some(future) => future.await.map_err(Into::into),
        None => Err(ResilienceError::NotConnected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::classification::DriverError;
    use crate::connection::connector::PoolUsage;

    /// Connector whose first `fail_connects` attempts fail.
    struct FlakyConnector {
        fail_connects: AtomicU32,
        connects: AtomicU32,
        shutdowns: AtomicU32,
        signals: broadcast::Sender<DriverSignal>,
    }

    impl FlakyConnector {
        fn new(fail_connects: u32) -> Self {
            let (signals, _) = broadcast::channel(16);
            Self {
                fail_connects: AtomicU32::new(fail_connects),
                connects: AtomicU32::new(0),
                shutdowns: AtomicU32::new(0),
                signals,
            }
        }
    }

    #[async_trait]
    impl StoreConnector for FlakyConnector {
        type Client = u32;

        async fn connect(&self) -> Result<u32, DriverError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self
                .fail_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
            {
                return Err(DriverError::network("connection refused"));
            }
            Ok(n)
        }

        async fn ping(&self, _client: &u32) -> Result<(), DriverError> {
            Ok(())
        }

        async fn shutdown(&self, _client: u32) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }

        fn pool_usage(&self) -> PoolUsage {
            PoolUsage {
                min: 1,
                max: 10,
                active: 2,
                wait_queue: 0,
            }
        }

        fn signals(&self) -> Option<broadcast::Receiver<DriverSignal>> {
            Some(self.signals.subscribe())
        }
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig::new()
            .with_connect_retries(3, 10, 100)
            .with_operation_retries(2, 10, 100)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_then_succeeds() {
        let manager = ConnectionManager::new(FlakyConnector::new(2), fast_config());
        let mut events = manager.subscribe();

        manager.connect().await.unwrap();

        assert!(manager.is_connected());
        assert_eq!(manager.connector().connects.load(Ordering::SeqCst), 3);
        assert_eq!(manager.stats().ready_state, ReadyState::Connected);
        assert_eq!(events.recv().await.unwrap().name(), "connected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_attempt() {
        let manager = ConnectionManager::new(FlakyConnector::new(0), fast_config());

        let (a, b, c) = tokio::join!(manager.connect(), manager.connect(), manager.connect());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(manager.connector().connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_ceiling() {
        let manager = ConnectionManager::new(FlakyConnector::new(100), fast_config());

        let err = manager.connect().await.unwrap_err();
        assert_eq!(err.attempts(), 4);
        assert!(!manager.is_connected());

        let stats = manager.stats();
        assert_eq!(stats.ready_state, ReadyState::Disconnected);
        assert_eq!(stats.failure_count, 1);
        assert!(stats.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_retry_counts_per_kind() {
        let manager = ConnectionManager::new(FlakyConnector::new(0), fast_config());
        manager.connect().await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let value = manager
            .execute_with_retry(OperationKind::Find, move |client| {
                let calls = c.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(DriverError::command(91, "shutting down"))
                    } else {
                        Ok(client + 41)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 41);

        let _ = manager
            .execute_with_retry(OperationKind::Insert, |_| async {
                Err::<(), _>(DriverError::command(11000, "E11000 duplicate key"))
            })
            .await;

        let stats = manager.stats();
        let find = stats.operations[&OperationKind::Find];
        assert_eq!((find.total, find.succeeded, find.failed, find.retried), (1, 1, 0, 1));
        let insert = stats.operations[&OperationKind::Insert];
        assert_eq!((insert.total, insert.failed, insert.retried), (1, 1, 0));
        assert_eq!(stats.pool.max, 10);
    }

    #[tokio::test]
    async fn test_execute_without_connection_is_not_connected() {
        let manager = ConnectionManager::new(
            FlakyConnector::new(0),
            ConnectionConfig::new().with_operation_retries(0, 1, 1),
        );
        let err = manager
            .execute_with_retry(OperationKind::Command, |_| async { Ok::<_, ResilienceError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err.root(), ResilienceError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_guarded_ignores_validation_failures() {
        let manager = ConnectionManager::with_breakers(
            FlakyConnector::new(0),
            fast_config().with_operation_retries(0, 10, 100),
            Arc::new(CircuitBreakerRegistry::new(
                crate::circuit_breaker::CircuitBreakerConfig::new().with_failure_threshold(2),
            )),
        );
        manager.connect().await.unwrap();

        for _ in 0..5 {
            let _ = manager
                .execute_guarded("users", OperationKind::Insert, |_| async {
                    Err::<(), _>(DriverError::command(121, "Document failed validation"))
                })
                .await;
        }
        let breaker = manager.breakers().get("users").unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = manager
            .execute_guarded("users", OperationKind::Find, |_| async {
                Err::<(), _>(DriverError::command(18, "Authentication failed"))
            })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_and_reconnect() {
        let manager = ConnectionManager::new(FlakyConnector::new(0), fast_config());
        manager.connect().await.unwrap();
        manager.disconnect().await;
        assert!(!manager.is_connected());
        assert_eq!(manager.connector().shutdowns.load(Ordering::SeqCst), 1);

        manager.reconnect().await.unwrap();
        assert!(manager.is_connected());
        assert_eq!(manager.stats().reconnect_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_signals_update_state() {
        let manager = ConnectionManager::new(FlakyConnector::new(0), fast_config());
        manager.connect().await.unwrap();
        let mut events = manager.subscribe();

        manager.handle_signal(DriverSignal::Disconnected {
            reason: "server lost".into(),
        });
        assert!(!manager.is_connected());
        assert_eq!(events.recv().await.unwrap().name(), "disconnected");

        manager.handle_signal(DriverSignal::Reconnected);
        assert!(manager.is_connected());
        assert_eq!(events.recv().await.unwrap().name(), "reconnected");
        assert_eq!(manager.stats().reconnect_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signals_from_connector_channel_are_applied() {
        let manager = ConnectionManager::new(FlakyConnector::new(0), fast_config());
        manager.connect().await.unwrap();
        let mut events = manager.subscribe();

        manager
            .connector()
            .signals
            .send(DriverSignal::Disconnected {
                reason: "heartbeat failed".into(),
            })
            .unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(event, ConnectionEvent::Disconnected { ref reason } if reason == "heartbeat failed"));
        assert!(!manager.is_connected());
    }
}
