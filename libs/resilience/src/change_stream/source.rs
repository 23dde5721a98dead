use async_trait::async_trait;
use futures::stream::BoxStream;

use super::event::{ChangeEvent, ResumeToken};
use crate::connection::{ConnectionManager, StoreConnector};
use crate::error::{ResilienceError, ResilienceResult};

/// Live, ordered feed of changes for one collection.
///
/// An `Err` item or the end of the stream means the feed is gone and must be
/// reopened.
pub type ChangeFeed = BoxStream<'static, ResilienceResult<ChangeEvent>>;

/// Seam between the change stream manager and a concrete store.
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    /// Open a feed on `collection`.
    ///
    /// With `resume_after`, the first event is the one committed right after
    /// that token. Without it the feed starts at the current time.
    async fn open(&self, collection: &str, resume_after: Option<ResumeToken>) -> ResilienceResult<ChangeFeed>;
}

/// Feed source that opens feeds on a given client handle.
#[async_trait]
pub trait ClientFeedSource<Client>: Send + Sync {
    async fn open_on(
        &self,
        client: &Client,
        collection: &str,
        resume_after: Option<ResumeToken>,
    ) -> ResilienceResult<ChangeFeed>;
}

/// [`ChangeFeedSource`] that opens every feed on the manager's current client.
///
/// After a reconnect the old pool is gone, so feeds reopened by the change
/// stream manager land on the new one. Opening while the manager holds no
/// client fails with [`ResilienceError::NotConnected`] and is retried like
/// any other open failure.
pub struct ManagedFeedSource<C: StoreConnector, S> {
    manager: ConnectionManager<C>,
    source: S,
}

impl<C: StoreConnector, S> ManagedFeedSource<C, S> {
    pub fn new(manager: ConnectionManager<C>, source: S) -> Self {
        Self { manager, source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

#[async_trait]
impl<C, S> ChangeFeedSource for ManagedFeedSource<C, S>
where
    C: StoreConnector,
    S: ClientFeedSource<C::Client>,
{
    async fn open(&self, collection: &str, resume_after: Option<ResumeToken>) -> ResilienceResult<ChangeFeed> {
        let client = self.manager.client().ok_or(ResilienceError::NotConnected)?;
        self.source.open_on(&client, collection, resume_after).await
    }
}
