//! In-memory change feed that behaves like a store's commit log.
//!
//! Every commit gets a sequence number per collection and a resume token of
//! the form `{"_data": "<collection>:<seq>"}`. Opening a feed with a token
//! replays every later commit; opening without one starts at the current end
//! of the log, so earlier commits are never seen.

use async_trait::async_trait;
use db_resilience::change_stream::{
    ChangeEvent, ChangeFeed, ChangeFeedSource, ChangeOperation, ClientFeedSource, ResumeToken,
};
use db_resilience::classification::DriverError;
use db_resilience::error::{ResilienceError, ResilienceResult};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::connector::FakeClient;

#[derive(Debug, Clone)]
struct Commit {
    operation: ChangeOperation,
    document_key: Value,
    document: Option<Value>,
}

#[derive(Default)]
struct LogState {
    commits: HashMap<String, Vec<Commit>>,
    /// Bumped on every injected disconnect; older feeds end with an error
    generation: u64,
    failing_opens: u32,
    opens: Vec<(String, Option<ResumeToken>)>,
    /// Client ids of every open made through a client handle
    clients: Vec<u32>,
}

struct Shared {
    state: Mutex<LogState>,
    changed: Notify,
}

/// Scripted [`ChangeFeedSource`] with disconnect injection
///
/// # Example
///
/// ```ignore
/// let source = ScriptedFeedSource::new();
/// source.insert("users", json!({"_id": 1, "name": "ada"}));
/// source.disconnect(); // every open feed fails with a network error
/// source.fail_next_opens(2); // and the next two reopen attempts fail too
/// ```
#[derive(Clone)]
pub struct ScriptedFeedSource {
    shared: Arc<Shared>,
}

impl ScriptedFeedSource {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LogState::default()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn insert(&self, collection: &str, document: Value) -> ResumeToken {
        let key = json!({ "_id": document.get("_id").cloned().unwrap_or(Value::Null) });
        self.commit(collection, ChangeOperation::Insert, key, Some(document))
    }

    pub fn update(&self, collection: &str, document: Value) -> ResumeToken {
        let key = json!({ "_id": document.get("_id").cloned().unwrap_or(Value::Null) });
        self.commit(collection, ChangeOperation::Update, key, Some(document))
    }

    pub fn delete(&self, collection: &str, id: Value) -> ResumeToken {
        self.commit(collection, ChangeOperation::Delete, json!({ "_id": id }), None)
    }

    /// Drop the collection: the feed delivers an invalidate event.
    pub fn invalidate(&self, collection: &str) -> ResumeToken {
        self.commit(collection, ChangeOperation::Invalidate, Value::Null, None)
    }

    /// End every open feed with a network error.
    pub fn disconnect(&self) {
        self.lock().generation += 1;
        self.shared.changed.notify_waiters();
    }

    /// The next `count` calls to `open` fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.lock().failing_opens = count;
    }

    /// Every `open` so far, with the token it resumed from.
    pub fn opens(&self) -> Vec<(String, Option<ResumeToken>)> {
        self.lock().opens.clone()
    }

    /// Ids of the clients feeds were opened on, in order.
    pub fn opened_on(&self) -> Vec<u32> {
        self.lock().clients.clone()
    }

    pub fn commit_count(&self, collection: &str) -> usize {
        self.lock().commits.get(collection).map_or(0, Vec::len)
    }

    /// Token the log hands out for the `seq`-th commit (1-based).
    pub fn token(collection: &str, seq: usize) -> ResumeToken {
        ResumeToken::new(json!({ "_data": format!("{collection}:{seq}") }))
    }

    fn commit(&self, collection: &str, operation: ChangeOperation, document_key: Value, document: Option<Value>) -> ResumeToken {
        let seq = {
            let mut state = self.lock();
            let log = state.commits.entry(collection.to_string()).or_default();
            log.push(Commit {
                operation,
                document_key,
                document,
            });
            log.len()
        };
        self.shared.changed.notify_waiters();
        Self::token(collection, seq)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.shared.state.lock().unwrap()
    }
}

impl Default for ScriptedFeedSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Sequence number encoded in a token issued for `collection`.
fn token_seq(collection: &str, token: &ResumeToken) -> Option<usize> {
    let data = token.as_value().get("_data")?.as_str()?;
    let (name, seq) = data.rsplit_once(':')?;
    if name != collection {
        return None;
    }
    seq.parse().ok()
}

enum Cursor {
    Reading {
        shared: Arc<Shared>,
        collection: String,
        next: usize,
        generation: u64,
    },
    Done,
}

async fn next_item(cursor: Cursor) -> Option<(ResilienceResult<ChangeEvent>, Cursor)> {
    let Cursor::Reading {
        shared,
        collection,
        next,
        generation,
    } = cursor
    else {
        return None;
    };

    loop {
        let notified = shared.changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        {
            let state = shared.state.lock().unwrap();
            if state.generation != generation {
                let err = ResilienceError::Driver(DriverError::network("change stream connection lost"));
                return Some((Err(err), Cursor::Done));
            }

            if let Some(commit) = state.commits.get(&collection).and_then(|log| log.get(next)) {
                let seq = next + 1;
                let mut event = ChangeEvent::new(
                    collection.clone(),
                    commit.operation,
                    ScriptedFeedSource::token(&collection, seq),
                );
                if !commit.document_key.is_null() {
                    event = event.with_document_key(commit.document_key.clone());
                }
                if let Some(document) = &commit.document {
                    event = event.with_full_document(document.clone());
                }
                drop(state);

                let cursor = Cursor::Reading {
                    shared: Arc::clone(&shared),
                    collection,
                    next: seq,
                    generation,
                };
                return Some((Ok(event), cursor));
            }
        }

        notified.await;
    }
}

#[async_trait]
impl ChangeFeedSource for ScriptedFeedSource {
    async fn open(&self, collection: &str, resume_after: Option<ResumeToken>) -> ResilienceResult<ChangeFeed> {
        let (next, generation) = {
            let mut state = self.lock();
            state.opens.push((collection.to_string(), resume_after.clone()));

            if state.failing_opens > 0 {
                state.failing_opens -= 1;
                return Err(ResilienceError::Driver(DriverError::network("server selection timed out")));
            }

            let next = match &resume_after {
                Some(token) => token_seq(collection, token).ok_or_else(|| ResilienceError::ChangeStream {
                    collection: collection.to_string(),
                    message: "resume token does not belong to this feed".to_string(),
                })?,
                None => state.commits.get(collection).map_or(0, Vec::len),
            };
            (next, state.generation)
        };

        let cursor = Cursor::Reading {
            shared: Arc::clone(&self.shared),
            collection: collection.to_string(),
            next,
            generation,
        };
        Ok(stream::unfold(cursor, next_item).boxed())
    }
}

/// Opening on a client that was shut down fails, like a closed driver pool.
#[async_trait]
impl ClientFeedSource<FakeClient> for ScriptedFeedSource {
    async fn open_on(
        &self,
        client: &FakeClient,
        collection: &str,
        resume_after: Option<ResumeToken>,
    ) -> ResilienceResult<ChangeFeed> {
        self.lock().clients.push(client.id);
        if !client.is_open() {
            return Err(ResilienceError::Driver(DriverError::network("client was shut down")));
        }
        self.open(collection, resume_after).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resume_replays_later_commits() {
        let source = ScriptedFeedSource::new();
        let first = source.insert("users", json!({"_id": 1}));
        source.insert("users", json!({"_id": 2}));

        let mut feed = source.open("users", Some(first)).await.unwrap();
        let event = feed.next().await.unwrap().unwrap();
        assert_eq!(event.document_key, Some(json!({"_id": 2})));
        assert_eq!(event.resume_token, ScriptedFeedSource::token("users", 2));
    }

    #[tokio::test]
    async fn test_open_without_token_starts_at_end() {
        let source = ScriptedFeedSource::new();
        source.insert("users", json!({"_id": 1}));

        let mut feed = source.open("users", None).await.unwrap();
        source.insert("users", json!({"_id": 2}));

        let event = feed.next().await.unwrap().unwrap();
        assert_eq!(event.document_key, Some(json!({"_id": 2})));
    }

    #[tokio::test]
    async fn test_open_on_closed_client_fails() {
        let source = ScriptedFeedSource::new();
        let client = FakeClient::new(1);
        assert!(source.open_on(&client, "users", None).await.is_ok());

        client.open.store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(source.open_on(&client, "users", None).await.is_err());
        assert_eq!(source.opened_on(), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_disconnect_ends_open_feeds() {
        let source = ScriptedFeedSource::new();
        let mut feed = source.open("users", None).await.unwrap();

        source.disconnect();
        assert!(feed.next().await.unwrap().is_err());
        assert!(feed.next().await.is_none());
    }
}
