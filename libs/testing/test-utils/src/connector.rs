//! Scriptable [`StoreConnector`] for exercising the connection manager
//! without a server.

use async_trait::async_trait;
use db_resilience::classification::DriverError;
use db_resilience::connection::{DriverSignal, PoolUsage, StoreConnector};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Handle returned by [`FakeConnector::connect`]; `id` counts successful connects.
///
/// Clones share one open flag, cleared when the connector shuts the client down.
#[derive(Debug, Clone)]
pub struct FakeClient {
    pub id: u32,
    pub(crate) open: Arc<AtomicBool>,
}

impl FakeClient {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl PartialEq for FakeClient {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FakeClient {}

/// Connector whose connect and ping outcomes are set by the test
///
/// # Example
///
/// ```ignore
/// let connector = FakeConnector::new();
/// connector.fail_next_connects(2, DriverError::network("connection refused"));
/// let manager = ConnectionManager::new(connector.clone(), ConnectionConfig::default());
/// manager.connect().await?; // succeeds on the third attempt
/// assert_eq!(connector.connect_attempts(), 3);
/// ```
#[derive(Clone)]
pub struct FakeConnector {
    inner: Arc<FakeState>,
}

struct FakeState {
    connect_attempts: AtomicU32,
    connects: AtomicU32,
    failing_connects: AtomicU32,
    connect_error: Mutex<DriverError>,
    ping_error: Mutex<Option<DriverError>>,
    ping_latency: Mutex<Duration>,
    pings: AtomicU32,
    shutdowns: AtomicU32,
    pool: Mutex<PoolUsage>,
    signals_enabled: AtomicBool,
    signals: broadcast::Sender<DriverSignal>,
}

impl FakeConnector {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(FakeState {
                connect_attempts: AtomicU32::new(0),
                connects: AtomicU32::new(0),
                failing_connects: AtomicU32::new(0),
                connect_error: Mutex::new(DriverError::network("connection refused")),
                ping_error: Mutex::new(None),
                ping_latency: Mutex::new(Duration::ZERO),
                pings: AtomicU32::new(0),
                shutdowns: AtomicU32::new(0),
                pool: Mutex::new(PoolUsage {
                    min: 5,
                    max: 100,
                    active: 0,
                    wait_queue: 0,
                }),
                signals_enabled: AtomicBool::new(true),
                signals,
            }),
        }
    }

    /// The next `count` connect attempts fail with `error`.
    pub fn fail_next_connects(&self, count: u32, error: DriverError) {
        *self.inner.connect_error.lock().unwrap() = error;
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Every ping fails with `error` until cleared with `None`.
    pub fn set_ping_error(&self, error: Option<DriverError>) {
        *self.inner.ping_error.lock().unwrap() = error;
    }

    /// Pings take this long (virtual time under a paused clock).
    pub fn set_ping_latency(&self, latency: Duration) {
        *self.inner.ping_latency.lock().unwrap() = latency;
    }

    pub fn set_pool_usage(&self, usage: PoolUsage) {
        *self.inner.pool.lock().unwrap() = usage;
    }

    /// Report no signal channel, as a driver without event hooks would.
    pub fn without_signals(self) -> Self {
        self.inner.signals_enabled.store(false, Ordering::SeqCst);
        self
    }

    /// Raise a driver signal to every subscribed manager.
    pub fn emit(&self, signal: DriverSignal) {
        let _ = self.inner.signals.send(signal);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn successful_connects(&self) -> u32 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> u32 {
        self.inner.pings.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> u32 {
        self.inner.shutdowns.load(Ordering::SeqCst)
    }
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreConnector for FakeConnector {
    type Client = FakeClient;

    async fn connect(&self) -> Result<FakeClient, DriverError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(self.inner.connect_error.lock().unwrap().clone());
        }

        let id = self.inner.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeClient::new(id))
    }

    async fn ping(&self, _client: &FakeClient) -> Result<(), DriverError> {
        self.inner.pings.fetch_add(1, Ordering::SeqCst);

        let latency = *self.inner.ping_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match self.inner.ping_error.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn shutdown(&self, client: FakeClient) {
        client.open.store(false, Ordering::SeqCst);
        self.inner.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    fn pool_usage(&self) -> PoolUsage {
        *self.inner.pool.lock().unwrap()
    }

    fn signals(&self) -> Option<broadcast::Receiver<DriverSignal>> {
        self.inner
            .signals_enabled
            .load(Ordering::SeqCst)
            .then(|| self.inner.signals.subscribe())
    }
}
