use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::event::ResumeToken;
use crate::error::ResilienceResult;

/// Durable storage for the last delivered resume token of each collection
///
/// Implementations can use different storage backends (MongoDB, memory, etc.)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResumeTokenStore: Send + Sync {
    /// Persist the token, replacing any previous one
    async fn save(&self, collection: &str, token: &ResumeToken) -> ResilienceResult<()>;

    /// Last persisted token, if any
    async fn load(&self, collection: &str) -> ResilienceResult<Option<ResumeToken>>;

    /// Forget the token; the next open starts at the current time
    async fn delete(&self, collection: &str) -> ResilienceResult<()>;
}

/// Process-local token store.
///
/// Survives stream reconnects but not restarts.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, ResumeToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous read of the current token.
    pub fn get(&self, collection: &str) -> Option<ResumeToken> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(collection)
            .cloned()
    }
}

#[async_trait]
impl ResumeTokenStore for MemoryTokenStore {
    async fn save(&self, collection: &str, token: &ResumeToken) -> ResilienceResult<()> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(collection.to_string(), token.clone());
        Ok(())
    }

    async fn load(&self, collection: &str) -> ResilienceResult<Option<ResumeToken>> {
        Ok(self.get(collection))
    }

    async fn delete(&self, collection: &str) -> ResilienceResult<()> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(collection);
        Ok(())
    }
}
