use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::classification::DriverError;

/// Pool occupancy reported by a connector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub min: u32,
    pub max: u32,
    /// Connections currently checked out
    pub active: u32,
    /// Callers waiting for a connection
    pub wait_queue: u32,
}

/// Out-of-band connection signals raised by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverSignal {
    Disconnected { reason: String },
    Reconnected,
    Error(DriverError),
}

/// Seam between the connection manager and a concrete store driver.
///
/// Implementations open the pool, answer a cheap round-trip probe, and may
/// expose a channel of driver signals (server lost, server back, pool errors).
#[async_trait]
pub trait StoreConnector: Send + Sync + 'static {
    /// Cloneable handle to the pool, shared by every caller.
    type Client: Clone + Send + Sync + 'static;

    /// Open the pool and verify it with a round-trip.
    async fn connect(&self) -> Result<Self::Client, DriverError>;

    /// Cheap round-trip against the server.
    async fn ping(&self, client: &Self::Client) -> Result<(), DriverError>;

    /// Release the pool. Must not fail.
    async fn shutdown(&self, client: Self::Client);

    fn pool_usage(&self) -> PoolUsage;

    /// Fresh receiver for driver signals, if the driver reports any.
    fn signals(&self) -> Option<broadcast::Receiver<DriverSignal>> {
        None
    }
}
