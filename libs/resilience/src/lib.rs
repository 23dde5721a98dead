//! Resilient access to a document store
//!
//! Building blocks that keep a service usable while its database misbehaves:
//!
//! - [`classification`] maps raw driver failures onto a stable taxonomy that
//!   drives every retry and response decision
//! - [`circuit_breaker`] and [`retry`] guard individual operations
//! - [`connection::ConnectionManager`] owns the shared pool, reconnects and
//!   keeps per-operation statistics
//! - [`health`] probes the connection, tracks alerts and history, and exposes
//!   the HTTP health surface
//! - [`metrics`] aggregates samples into hourly and daily roll-ups and
//!   exports Prometheus counters
//! - [`change_stream`] keeps per-collection change feeds alive across
//!   disconnects using persisted resume tokens
//!
//! # Features
//!
//! - `mongodb` (default) - MongoDB connector, change feed source and token store
//! - `config` (default) - `core_config::FromEnv` for every config struct
//! - `http` (default) - axum router for the health endpoints
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use db_resilience::connection::{ConnectionConfig, ConnectionManager, OperationKind};
//! use db_resilience::mongodb::{MongoConfig, MongoConnector};
//!
//! let connector = MongoConnector::new(MongoConfig::with_database("mongodb://localhost:27017", "app"));
//! let manager = ConnectionManager::new(connector, ConnectionConfig::default());
//! manager.connect().await?;
//!
//! let names = manager
//!     .execute_with_retry(OperationKind::Command, |client| async move {
//!         client.database("app").list_collection_names().await
//!     })
//!     .await?;
//! ```

pub mod change_stream;
pub mod circuit_breaker;
pub mod classification;
pub mod common;
pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod metrics;
pub mod retry;
pub mod shutdown;

#[cfg(feature = "mongodb")]
pub mod mongodb;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitEvent, CircuitState,
};
pub use classification::{
    classify, Classification, Classify, DriverError, DriverErrorKind, ErrorCategory, ErrorType,
    Severity, UserImpact,
};
pub use config::ResilienceConfig;
pub use error::{ResilienceError, ResilienceResult};
pub use retry::{with_retry, RetryExecutor, RetryOptions};
pub use shutdown::{graceful_shutdown, ShutdownCoordinator};
