//! Shared connection pool ownership, operation execution and statistics.

pub mod config;
pub mod connector;
pub mod manager;
pub mod stats;

pub use config::ConnectionConfig;
pub use connector::{DriverSignal, PoolUsage, StoreConnector};
pub use manager::{ConnectionEvent, ConnectionManager, ManagedConnection};
pub use stats::{ConnectionStats, LatencySummary, OperationCounters, OperationKind, ReadyState};
