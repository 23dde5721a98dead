use async_trait::async_trait;
use futures::future;
use futures::StreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken as MongoResumeToken};
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use super::MongoConnector;
use crate::change_stream::{ChangeEvent, ChangeFeed, ChangeOperation, ClientFeedSource, ManagedFeedSource, ResumeToken};
use crate::connection::ConnectionManager;
use crate::error::{ResilienceError, ResilienceResult};

/// `collection.watch()` on the configured database of whichever client it is given.
///
/// Update events carry the current post-image when `full_document` is set.
/// Drop and rename events are skipped; the invalidate that follows them is
/// passed through.
#[derive(Clone)]
pub struct MongoFeedSource {
    database: String,
    full_document: bool,
}

impl MongoFeedSource {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            full_document: true,
        }
    }

    /// Feed source bound to the manager's current client.
    pub fn managed(manager: ConnectionManager<MongoConnector>) -> ManagedFeedSource<MongoConnector, Self> {
        let database = manager.connector().config().database.clone();
        ManagedFeedSource::new(manager, Self::new(database))
    }

    pub fn with_full_document(mut self, enabled: bool) -> Self {
        self.full_document = enabled;
        self
    }
}

#[async_trait]
impl ClientFeedSource<Client> for MongoFeedSource {
    #[instrument(skip(self, client, resume_after), fields(database = %self.database, resumed = resume_after.is_some()))]
    async fn open_on(
        &self,
        client: &Client,
        collection: &str,
        resume_after: Option<ResumeToken>,
    ) -> ResilienceResult<ChangeFeed> {
        let mut options = ChangeStreamOptions::default();
        if self.full_document {
            options.full_document = Some(FullDocumentType::UpdateLookup);
        }
        if let Some(token) = resume_after {
            options.resume_after = Some(to_mongo_token(collection, token)?);
        }

        let stream = client
            .database(&self.database)
            .collection::<Document>(collection)
            .watch()
            .with_options(options)
            .await?;
        debug!(collection, "MongoDB change stream opened");

        let name = collection.to_string();
        let feed = stream.filter_map(move |item| {
            future::ready(match item {
                Ok(event) => to_change_event(&name, event),
                Err(e) => Some(Err(ResilienceError::from(e))),
            })
        });
        Ok(feed.boxed())
    }
}

fn to_change_event(collection: &str, event: ChangeStreamEvent<Document>) -> Option<ResilienceResult<ChangeEvent>> {
    let operation = match event.operation_type {
        OperationType::Insert => ChangeOperation::Insert,
        OperationType::Update => ChangeOperation::Update,
        OperationType::Replace => ChangeOperation::Replace,
        OperationType::Delete => ChangeOperation::Delete,
        OperationType::Invalidate => ChangeOperation::Invalidate,
        other => {
            debug!(collection, operation = ?other, "Skipping change event");
            return None;
        }
    };

    let token = match bson::to_bson(&event.id) {
        Ok(raw) => ResumeToken::new(raw.into_relaxed_extjson()),
        Err(e) => {
            return Some(Err(ResilienceError::ChangeStream {
                collection: collection.to_string(),
                message: format!("unreadable resume token: {e}"),
            }))
        }
    };

    let mut change = ChangeEvent::new(collection, operation, token);
    if let Some(key) = event.document_key {
        change = change.with_document_key(document_to_json(key));
    }
    if let Some(document) = event.full_document {
        change = change.with_full_document(document_to_json(document));
    }
    Some(Ok(change))
}

fn document_to_json(document: Document) -> Value {
    Bson::Document(document).into_relaxed_extjson()
}

fn to_mongo_token(collection: &str, token: ResumeToken) -> ResilienceResult<MongoResumeToken> {
    let invalid = |message: String| ResilienceError::ChangeStream {
        collection: collection.to_string(),
        message,
    };
    let raw = Bson::try_from(token.into_value()).map_err(|e| invalid(format!("invalid resume token: {e}")))?;

    // Round-trip through raw bytes so the driver keeps the token verbatim
    let bytes = bson::to_vec(&doc! { "token": raw }).map_err(|e| invalid(e.to_string()))?;
    let wrapped: TokenDocument = bson::from_slice(&bytes).map_err(|e| invalid(format!("invalid resume token: {e}")))?;
    Ok(wrapped.token)
}

#[derive(Deserialize)]
struct TokenDocument {
    token: MongoResumeToken,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_to_json_uses_relaxed_extended_json() {
        let value = document_to_json(doc! { "name": "ada", "age": 36_i32 });
        assert_eq!(value, json!({ "name": "ada", "age": 36 }));
    }

    #[test]
    fn test_resume_token_converts_to_driver_token() {
        let token = ResumeToken::new(json!({ "_data": "8263A1B2C3000000012B022C0100296E5A1004" }));
        assert!(to_mongo_token("users", token).is_ok());
    }
}
