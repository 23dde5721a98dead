use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::config::ChangeStreamConfig;
use super::event::{ChangeEvent, ChangeOperation, ResumeToken};
use super::source::ChangeFeedSource;
use super::token_store::ResumeTokenStore;
use crate::common::as_millis;
use crate::error::{ResilienceError, ResilienceResult};

const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;

pub type ListenerId = u64;

/// Receives every change of one collection, in commit order.
///
/// Called from the collection's stream task; a slow listener delays the
/// following events of that collection only.
pub trait ChangeListener: Send + Sync + 'static {
    fn on_change(&self, event: &ChangeEvent);
}

impl<F> ChangeListener for F
where
    F: Fn(&ChangeEvent) + Send + Sync + 'static,
{
    fn on_change(&self, event: &ChangeEvent) {
        self(event)
    }
}

/// Published on the manager's broadcast channel.
#[derive(Debug, Clone)]
pub enum ChangeNotification {
    Opened { collection: String, resumed: bool },
    Change(ChangeEvent),
    /// Reconnect budget exhausted; no further automatic attempts
    Failed {
        collection: String,
        attempts: u32,
        error: String,
    },
    Invalidated { collection: String },
}

impl ChangeNotification {
    pub fn name(&self) -> String {
        match self {
            ChangeNotification::Opened { .. } => "stream_opened".to_string(),
            ChangeNotification::Change(event) => event.event_name(),
            ChangeNotification::Failed { .. } => "stream_failed".to_string(),
            ChangeNotification::Invalidated { .. } => "stream_invalidated".to_string(),
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            ChangeNotification::Opened { collection, .. }
            | ChangeNotification::Failed { collection, .. }
            | ChangeNotification::Invalidated { collection } => collection,
            ChangeNotification::Change(event) => &event.collection,
        }
    }
}

/// Per-collection status for the admin surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeStreamStatus {
    pub collection: String,
    pub active: bool,
    pub failed: bool,
    pub invalidated: bool,
    pub reconnect_attempts: u32,
    pub has_resume_token: bool,
    pub listeners: usize,
    pub delivered: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Default)]
struct StreamState {
    resume_token: Option<ResumeToken>,
    reconnect_attempts: u32,
    active: bool,
    failed: bool,
    invalidated: bool,
    listeners: Vec<(ListenerId, Arc<dyn ChangeListener>)>,
    delivered: u64,
    last_error: Option<String>,
    task: Option<JoinHandle<()>>,
}

enum FeedEnd {
    Invalidated,
    Lost(ResilienceError),
}

/// One resumable change feed per watched collection.
///
/// Every delivered event's resume token is persisted before listeners run,
/// so a reconnect or restart resumes right after the last delivered event
/// (the boundary event may be seen twice, none is skipped). Without a stored
/// token a feed starts at the current time.
///
/// Lost feeds are reopened with jittered exponential backoff. After
/// `max_retries` consecutive failures the stream is marked failed and left
/// alone until [`restart`](Self::restart).
pub struct ChangeStreamManager {
    source: Arc<dyn ChangeFeedSource>,
    tokens: Arc<dyn ResumeTokenStore>,
    config: ChangeStreamConfig,
    streams: Mutex<HashMap<String, StreamState>>,
    next_listener: AtomicU64,
    notifications: broadcast::Sender<ChangeNotification>,
}

impl ChangeStreamManager {
    pub fn new(
        source: Arc<dyn ChangeFeedSource>,
        tokens: Arc<dyn ResumeTokenStore>,
        config: ChangeStreamConfig,
    ) -> ResilienceResult<Self> {
        config.validate()?;
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);

        Ok(Self {
            source,
            tokens,
            config,
            streams: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            notifications,
        })
    }

    pub fn config(&self) -> &ChangeStreamConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.notifications.subscribe()
    }

    /// Open a feed for every configured collection.
    pub async fn initialize(self: &Arc<Self>) -> ResilienceResult<()> {
        info!(
            collections = ?self.config.collections,
            "Initializing change streams"
        );
        for collection in self.config.collections.clone() {
            self.watch(&collection).await?;
        }
        Ok(())
    }

    /// Open a feed on `collection`, resuming from its stored token.
    ///
    /// A no-op when the collection is already being watched.
    #[instrument(skip(self))]
    pub async fn watch(self: &Arc<Self>, collection: &str) -> ResilienceResult<()> {
        if collection.trim().is_empty() {
            return Err(ResilienceError::Config("collection name is blank".to_string()));
        }
        if self
            .lock_streams()
            .get(collection)
            .and_then(|s| s.task.as_ref())
            .is_some_and(|task| !task.is_finished())
        {
            debug!(collection, "Change stream already running");
            return Ok(());
        }

        let stored = match self.tokens.load(collection).await {
            Ok(token) => token,
            Err(err) => {
                warn!(collection, error = %err, "Failed to load resume token, starting from now");
                None
            }
        };

        let mut streams = self.lock_streams();
        let state = streams.entry(collection.to_string()).or_default();
        if state.resume_token.is_none() {
            state.resume_token = stored;
        }
        self.spawn_stream(collection, state);
        Ok(())
    }

    /// Register a listener. Listeners may be added before the feed opens.
    pub fn add_listener<L: ChangeListener>(&self, collection: &str, listener: L) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.lock_streams()
            .entry(collection.to_string())
            .or_default()
            .listeners
            .push((id, Arc::new(listener)));
        debug!(collection, listener = id, "Change listener added");
        id
    }

    pub fn remove_listener(&self, collection: &str, id: ListenerId) -> bool {
        let mut streams = self.lock_streams();
        let Some(state) = streams.get_mut(collection) else {
            return false;
        };
        let before = state.listeners.len();
        state.listeners.retain(|(listener, _)| *listener != id);
        before != state.listeners.len()
    }

    /// Clear the failed flag and attempts, then reopen from the stored token.
    ///
    /// With `None`, restarts every known collection. Returns the restarted names.
    pub fn restart(self: &Arc<Self>, collection: Option<&str>) -> ResilienceResult<Vec<String>> {
        let mut streams = self.lock_streams();
        let targets: Vec<String> = match collection {
            Some(name) if streams.contains_key(name) => vec![name.to_string()],
            Some(name) => {
                return Err(ResilienceError::ChangeStream {
                    collection: name.to_string(),
                    message: "collection is not being watched".to_string(),
                });
            }
            None => {
                let mut all: Vec<String> = streams.keys().cloned().collect();
                all.sort();
                all
            }
        };

        for name in &targets {
            if let Some(state) = streams.get_mut(name) {
                info!(collection = %name, "Restarting change stream");
                self.spawn_stream(name, state);
            }
        }

        Ok(targets)
    }

    /// Stop every feed and drop all stream state.
    pub async fn close(&self) {
        let tasks: Vec<(String, JoinHandle<()>)> = self
            .lock_streams()
            .drain()
            .filter_map(|(name, mut state)| state.task.take().map(|task| (name, task)))
            .collect();

        for (collection, task) in tasks {
            task.abort();
            let _ = task.await;
            info!(collection = %collection, "Change stream closed");
        }
    }

    /// Status of every known collection, sorted by name.
    pub fn status(&self) -> Vec<ChangeStreamStatus> {
        let streams = self.lock_streams();
        let mut status: Vec<ChangeStreamStatus> = streams
            .iter()
            .map(|(collection, state)| ChangeStreamStatus {
                collection: collection.clone(),
                active: state.active,
                failed: state.failed,
                invalidated: state.invalidated,
                reconnect_attempts: state.reconnect_attempts,
                has_resume_token: state.resume_token.is_some(),
                listeners: state.listeners.len(),
                delivered: state.delivered,
                last_error: state.last_error.clone(),
            })
            .collect();
        status.sort_by(|a, b| a.collection.cmp(&b.collection));
        status
    }

    /// Whether any stream gave up reconnecting.
    pub fn has_failures(&self) -> bool {
        self.lock_streams().values().any(|state| state.failed)
    }

    pub fn resume_token(&self, collection: &str) -> Option<ResumeToken> {
        self.lock_streams()
            .get(collection)
            .and_then(|state| state.resume_token.clone())
    }

    /// Start a fresh feed task with a full reconnect budget.
    fn spawn_stream(self: &Arc<Self>, collection: &str, state: &mut StreamState) {
        if let Some(previous) = state.task.take() {
            previous.abort();
        }
        state.failed = false;
        state.invalidated = false;
        state.reconnect_attempts = 0;
        state.last_error = None;
        let manager = Arc::clone(self);
        let name = collection.to_string();
        state.task = Some(tokio::spawn(async move { manager.run_stream(name).await }));
    }

    async fn run_stream(self: Arc<Self>, collection: String) {
        loop {
            let resume_after = self.resume_token(&collection);
            let resumed = resume_after.is_some();

            let mut feed = match self.source.open(&collection, resume_after).await {
                Ok(feed) => feed,
                Err(err) => {
                    if self.schedule_reconnect(&collection, &err).await {
                        continue;
                    }
                    return;
                }
            };

            {
                let mut streams = self.lock_streams();
                if let Some(state) = streams.get_mut(&collection) {
                    state.active = true;
                }
            }
            info!(collection = %collection, resumed, "Change stream opened");
            self.notify(ChangeNotification::Opened {
                collection: collection.clone(),
                resumed,
            });

            let end = loop {
                match feed.next().await {
                    Some(Ok(event)) => {
                        let invalidate = event.operation_type == ChangeOperation::Invalidate;
                        self.deliver(&collection, event).await;
                        if invalidate {
                            break FeedEnd::Invalidated;
                        }
                    }
                    Some(Err(err)) => break FeedEnd::Lost(err),
                    None => {
                        break FeedEnd::Lost(ResilienceError::ChangeStream {
                            collection: collection.clone(),
                            message: "change stream closed by server".to_string(),
                        });
                    }
                }
            };

            match end {
                FeedEnd::Invalidated => {
                    // A feed cannot resume past its invalidate; a restart opens at now
                    {
                        let mut streams = self.lock_streams();
                        if let Some(state) = streams.get_mut(&collection) {
                            state.active = false;
                            state.invalidated = true;
                            state.resume_token = None;
                            state.last_error = Some("change stream invalidated".to_string());
                        }
                    }
                    if let Err(err) = self.tokens.delete(&collection).await {
                        warn!(collection = %collection, error = %err, "Failed to delete resume token");
                    }
                    warn!(collection = %collection, "Change stream invalidated, not reconnecting");
                    self.notify(ChangeNotification::Invalidated { collection });
                    return;
                }
                FeedEnd::Lost(err) => {
                    if !self.schedule_reconnect(&collection, &err).await {
                        return;
                    }
                }
            }
        }
    }

    /// Persist the token, then hand the event to listeners.
    async fn deliver(&self, collection: &str, event: ChangeEvent) {
        if let Err(err) = self.tokens.save(collection, &event.resume_token).await {
            warn!(collection, error = %err, "Failed to persist resume token");
        }

        let listeners: Vec<Arc<dyn ChangeListener>> = {
            let mut streams = self.lock_streams();
            let Some(state) = streams.get_mut(collection) else {
                return;
            };
            state.resume_token = Some(event.resume_token.clone());
            state.reconnect_attempts = 0;
            state.delivered += 1;
            state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        debug!(
            collection,
            operation = %event.operation_type,
            listeners = listeners.len(),
            "Delivering change event"
        );
        for listener in &listeners {
            listener.on_change(&event);
        }
        self.notify(ChangeNotification::Change(event));
    }

    /// Record the failure and sleep before the next attempt.
    ///
    /// Returns false once the reconnect budget is spent.
    async fn schedule_reconnect(&self, collection: &str, err: &ResilienceError) -> bool {
        let attempt = {
            let mut streams = self.lock_streams();
            let Some(state) = streams.get_mut(collection) else {
                return false;
            };
            state.active = false;
            state.last_error = Some(err.to_string());
            if state.reconnect_attempts >= self.config.max_retries {
                state.failed = true;
                None
            } else {
                let attempt = state.reconnect_attempts;
                state.reconnect_attempts += 1;
                Some(attempt)
            }
        };

        match attempt {
            Some(attempt) => {
                let delay = self.config.backoff_delay(attempt);
                warn!(
                    collection,
                    attempt = attempt + 1,
                    max_retries = self.config.max_retries,
                    backoff_ms = as_millis(delay),
                    error = %err,
                    "Change stream lost, reconnecting"
                );
                tokio::time::sleep(delay).await;
                true
            }
            None => {
                error!(
                    collection,
                    attempts = self.config.max_retries,
                    error = %err,
                    "Change stream failed permanently"
                );
                self.notify(ChangeNotification::Failed {
                    collection: collection.to_string(),
                    attempts: self.config.max_retries,
                    error: err.to_string(),
                });
                false
            }
        }
    }

    fn notify(&self, notification: ChangeNotification) {
        let _ = self.notifications.send(notification);
    }

    fn lock_streams(&self) -> MutexGuard<'_, HashMap<String, StreamState>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_stream::source::ChangeFeed;
    use crate::change_stream::token_store::{MemoryTokenStore, MockResumeTokenStore};
    use crate::classification::DriverError;
    use async_trait::async_trait;
    use futures::stream;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;

    type Script = ResilienceResult<Vec<ResilienceResult<ChangeEvent>>>;

    /// Each `open` consumes the next script; once scripts run out, opens
    /// return a feed that never yields.
    #[derive(Default)]
    struct ScriptedSource {
        scripts: Mutex<VecDeque<Script>>,
        opened_with: Mutex<Vec<Option<ResumeToken>>>,
    }

    impl ScriptedSource {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                opened_with: Mutex::new(Vec::new()),
            })
        }

        fn opens(&self) -> Vec<Option<ResumeToken>> {
            self.opened_with.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChangeFeedSource for ScriptedSource {
        async fn open(&self, _collection: &str, resume_after: Option<ResumeToken>) -> ResilienceResult<ChangeFeed> {
            self.opened_with.lock().unwrap().push(resume_after);
            match self.scripts.lock().unwrap().pop_front() {
                Some(Ok(items)) => Ok(stream::iter(items).chain(stream::pending()).boxed()),
                Some(Err(err)) => Err(err),
                None => Ok(stream::pending().boxed()),
            }
        }
    }

    fn token(seq: u32) -> ResumeToken {
        ResumeToken::new(json!({ "_data": format!("{seq:04}") }))
    }

    fn insert(seq: u32) -> ResilienceResult<ChangeEvent> {
        Ok(ChangeEvent::new("users", ChangeOperation::Insert, token(seq)).with_full_document(json!({ "seq": seq })))
    }

    fn lost() -> ResilienceResult<ChangeEvent> {
        Err(DriverError::network("connection closed").into())
    }

    fn config(max_retries: u32) -> ChangeStreamConfig {
        ChangeStreamConfig::new()
            .with_collections(["users"])
            .with_retries(max_retries, 100, 1000)
            .without_jitter()
    }

    fn recorder(manager: &ChangeStreamManager) -> Arc<Mutex<Vec<u32>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.add_listener("users", move |event: &ChangeEvent| {
            let seq = event.full_document.as_ref().and_then(|d| d["seq"].as_u64()).unwrap_or(0);
            sink.lock().unwrap().push(seq as u32);
        });
        seen
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(30)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_in_commit_order() {
        let source = ScriptedSource::new(vec![Ok((1..=5).map(insert).collect())]);
        let manager = Arc::new(ChangeStreamManager::new(source.clone(), Arc::new(MemoryTokenStore::new()), config(3)).unwrap());
        let seen = recorder(&manager);

        manager.initialize().await.unwrap();
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(manager.resume_token("users"), Some(token(5)));
        let status = &manager.status()[0];
        assert!(status.active);
        assert_eq!(status.delivered, 5);
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_opens_without_token() {
        let source = ScriptedSource::new(vec![]);
        let manager = Arc::new(ChangeStreamManager::new(source.clone(), Arc::new(MemoryTokenStore::new()), config(3)).unwrap());

        manager.initialize().await.unwrap();
        settle().await;

        assert_eq!(source.opens(), vec![None]);
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resumes_after_last_delivered_event() {
        let source = ScriptedSource::new(vec![
            Ok(vec![insert(1), insert(2), lost()]),
            Ok(vec![insert(3), insert(4)]),
        ]);
        let manager = Arc::new(ChangeStreamManager::new(source.clone(), Arc::new(MemoryTokenStore::new()), config(3)).unwrap());
        let seen = recorder(&manager);

        manager.initialize().await.unwrap();
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(source.opens(), vec![None, Some(token(2))]);
        assert_eq!(manager.status()[0].reconnect_attempts, 0);
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_is_persisted_before_listeners_run() {
        let store = Arc::new(MemoryTokenStore::new());
        let source = ScriptedSource::new(vec![Ok(vec![insert(1), insert(2)])]);
        let manager = Arc::new(ChangeStreamManager::new(source, store.clone(), config(3)).unwrap());

        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        let tokens = store.clone();
        manager.add_listener("users", move |event: &ChangeEvent| {
            sink.lock().unwrap().push(tokens.get("users") == Some(event.resume_token.clone()));
        });

        manager.initialize().await.unwrap();
        settle().await;

        assert_eq!(*observed.lock().unwrap(), vec![true, true]);
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let failures = (0..10)
            .map(|_| Err(DriverError::network("no primary").into()))
            .collect();
        let source = ScriptedSource::new(failures);
        let manager = Arc::new(ChangeStreamManager::new(source.clone(), Arc::new(MemoryTokenStore::new()), config(2)).unwrap());
        let mut notifications = manager.subscribe();

        manager.initialize().await.unwrap();
        settle().await;

        assert_eq!(source.opens().len(), 3);
        assert!(manager.has_failures());
        let status = &manager.status()[0];
        assert!(status.failed && !status.active);
        assert!(status.last_error.as_deref().unwrap().contains("no primary"));

        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.name(), "stream_failed");

        // No further automatic attempts
        settle().await;
        assert_eq!(source.opens().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_clears_failure() {
        let source = ScriptedSource::new(vec![Err(DriverError::network("down").into())]);
        let manager = Arc::new(ChangeStreamManager::new(source.clone(), Arc::new(MemoryTokenStore::new()), config(0)).unwrap());

        manager.initialize().await.unwrap();
        settle().await;
        assert!(manager.has_failures());

        let restarted = manager.restart(None).unwrap();
        assert_eq!(restarted, vec!["users"]);
        settle().await;

        assert!(!manager.has_failures());
        assert!(manager.status()[0].active);
        assert!(manager.restart(Some("missing")).is_err());
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_ends_feed_without_reconnect() {
        let source = ScriptedSource::new(vec![Ok(vec![
            insert(1),
            Ok(ChangeEvent::new("users", ChangeOperation::Invalidate, token(2))),
        ])]);
        let manager = Arc::new(ChangeStreamManager::new(source.clone(), Arc::new(MemoryTokenStore::new()), config(3)).unwrap());
        let seen = recorder(&manager);

        manager.initialize().await.unwrap();
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 0]);
        assert_eq!(source.opens().len(), 1);
        let status = &manager.status()[0];
        assert!(status.invalidated && !status.active && !status.failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_after_failure_starts_with_fresh_budget() {
        let mut scripts: Vec<Script> = (0..4)
            .map(|_| Err(DriverError::network("no primary").into()))
            .collect();
        scripts.push(Ok(vec![insert(1)]));
        let source = ScriptedSource::new(scripts);
        let manager = Arc::new(ChangeStreamManager::new(source.clone(), Arc::new(MemoryTokenStore::new()), config(2)).unwrap());
        let seen = recorder(&manager);

        manager.initialize().await.unwrap();
        settle().await;
        assert!(manager.has_failures());
        assert_eq!(source.opens().len(), 3);

        // One failed open is retried instead of failing the stream again
        manager.watch("users").await.unwrap();
        settle().await;

        assert_eq!(source.opens().len(), 5);
        assert!(!manager.has_failures());
        let status = &manager.status()[0];
        assert!(status.active && !status.invalidated);
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forgets_resume_token() {
        let store = Arc::new(MemoryTokenStore::new());
        let source = ScriptedSource::new(vec![Ok(vec![
            insert(1),
            Ok(ChangeEvent::new("users", ChangeOperation::Invalidate, token(2))),
        ])]);
        let manager = Arc::new(ChangeStreamManager::new(source.clone(), store.clone(), config(3)).unwrap());

        manager.initialize().await.unwrap();
        settle().await;

        assert_eq!(store.get("users"), None);
        assert_eq!(manager.resume_token("users"), None);
        assert!(!manager.status()[0].has_resume_token);

        manager.restart(Some("users")).unwrap();
        settle().await;
        assert_eq!(source.opens(), vec![None, None]);
        assert!(!manager.status()[0].invalidated);
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_listener_stops_receiving() {
        let source = ScriptedSource::new(vec![]);
        let manager = Arc::new(ChangeStreamManager::new(source, Arc::new(MemoryTokenStore::new()), config(3)).unwrap());

        let id = manager.add_listener("users", |_: &ChangeEvent| {});
        assert_eq!(manager.status()[0].listeners, 1);
        assert!(manager.remove_listener("users", id));
        assert!(!manager.remove_listener("users", id));
        assert_eq!(manager.status()[0].listeners, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_resumes_from_stored_token() {
        let mut store = MockResumeTokenStore::new();
        store
            .expect_load()
            .withf(|collection| collection == "users")
            .returning(|_| Ok(Some(token(41))));
        store.expect_save().returning(|_, _| Ok(()));

        let source = ScriptedSource::new(vec![Ok(vec![insert(42)])]);
        let manager = Arc::new(ChangeStreamManager::new(source.clone(), Arc::new(store), config(3)).unwrap());

        manager.initialize().await.unwrap();
        settle().await;

        assert_eq!(source.opens(), vec![Some(token(41))]);
        assert_eq!(manager.resume_token("users"), Some(token(42)));
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drops_stream_state() {
        let source = ScriptedSource::new(vec![]);
        let manager = Arc::new(ChangeStreamManager::new(source, Arc::new(MemoryTokenStore::new()), config(3)).unwrap());

        manager.initialize().await.unwrap();
        settle().await;
        manager.close().await;

        assert!(manager.status().is_empty());
    }
}
