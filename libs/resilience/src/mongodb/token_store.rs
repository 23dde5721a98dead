use async_trait::async_trait;
use mongodb::bson::{doc, Bson, DateTime, Document};
use mongodb::Collection;
use tracing::debug;

use super::MongoConnector;
use crate::change_stream::{ResumeToken, ResumeTokenStore};
use crate::connection::ConnectionManager;
use crate::error::{ResilienceError, ResilienceResult};

/// Collection holding one resume token per watched collection
pub const RESUME_TOKEN_COLLECTION: &str = "_resume_tokens";

/// [`ResumeTokenStore`] persisted in MongoDB so a restarted process resumes
/// where it left off.
///
/// Documents are keyed by collection name:
/// `{ _id: "<collection>", token: <resume token>, updated_at: <date> }`.
/// Every call goes through the manager's current client, so tokens keep
/// saving after a reconnect replaced the pool.
#[derive(Clone)]
pub struct MongoTokenStore {
    manager: ConnectionManager<MongoConnector>,
    collection: String,
}

impl MongoTokenStore {
    pub fn new(manager: ConnectionManager<MongoConnector>) -> Self {
        Self::with_collection(manager, RESUME_TOKEN_COLLECTION)
    }

    pub fn with_collection(manager: ConnectionManager<MongoConnector>, name: &str) -> Self {
        Self {
            manager,
            collection: name.to_string(),
        }
    }

    fn tokens(&self) -> ResilienceResult<Collection<Document>> {
        let client = self.manager.client().ok_or(ResilienceError::NotConnected)?;
        Ok(self.manager.connector().database(&client).collection(&self.collection))
    }
}

#[async_trait]
impl ResumeTokenStore for MongoTokenStore {
    async fn save(&self, collection: &str, token: &ResumeToken) -> ResilienceResult<()> {
        let value = Bson::try_from(token.as_value().clone()).map_err(|e| ResilienceError::ChangeStream {
            collection: collection.to_string(),
            message: format!("resume token is not valid extended JSON: {e}"),
        })?;

        self.tokens()?
            .update_one(
                doc! { "_id": collection },
                doc! { "$set": { "token": value, "updated_at": DateTime::now() } },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn load(&self, collection: &str) -> ResilienceResult<Option<ResumeToken>> {
        let stored = self.tokens()?.find_one(doc! { "_id": collection }).await?;
        let token = stored
            .and_then(|mut document| document.remove("token"))
            .map(|value| ResumeToken::new(value.into_relaxed_extjson()));

        debug!(collection, found = token.is_some(), "Loaded resume token");
        Ok(token)
    }

    async fn delete(&self, collection: &str) -> ResilienceResult<()> {
        self.tokens()?.delete_one(doc! { "_id": collection }).await?;
        Ok(())
    }
}
