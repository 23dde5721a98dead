//! Shared test utilities for the resilience crates
//!
//! - `FakeConnector`: scriptable connector for the connection manager (always available)
//! - `ScriptedFeedSource`: in-memory commit log behind a change feed (always available)
//! - `TestMongo`: MongoDB replica-set container with automatic cleanup (feature: "mongo")
//!
//! # Usage
//!
//! ```rust,ignore
//! use db_resilience::change_stream::{ChangeStreamConfig, ChangeStreamManager, MemoryTokenStore};
//! use test_utils::ScriptedFeedSource;
//!
//! #[tokio::test]
//! async fn my_change_stream_test() {
//!     let source = ScriptedFeedSource::new();
//!     let manager = ChangeStreamManager::new(
//!         Arc::new(source.clone()),
//!         Arc::new(MemoryTokenStore::new()),
//!         ChangeStreamConfig::default().with_collections(["users"]),
//!     )
//!     .unwrap();
//!
//!     source.insert("users", json!({"_id": 1}));
//! }
//! ```

mod connector;
mod feed;

#[cfg(feature = "mongo")]
mod mongo;

pub use connector::{FakeClient, FakeConnector};
pub use feed::ScriptedFeedSource;

#[cfg(feature = "mongo")]
pub use mongo::TestMongo;

/// Test assertion helpers
pub mod assertions {
    use std::future::Future;
    use std::time::Duration;

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Poll `condition` until it holds, panicking after `timeout`.
    ///
    /// Runs on tokio time, so it advances instantly under a paused clock.
    pub async fn eventually<F, Fut>(timeout: Duration, context: &str, mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition().await {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("{}: condition not met within {:?}", context, timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
