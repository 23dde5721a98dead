//! End-to-end checks against a real MongoDB replica set.
//!
//! Run with `cargo test -p db_resilience -- --ignored` (needs Docker).

#![cfg(feature = "mongodb")]

use db_resilience::change_stream::{ChangeEvent, ChangeOperation, ChangeStreamConfig, ChangeStreamManager, ResumeTokenStore};
use db_resilience::connection::{ConnectionConfig, ConnectionManager, OperationKind};
use db_resilience::mongodb::{MongoConfig, MongoConnector, MongoFeedSource, MongoTokenStore};
use mongodb::bson::{doc, Document};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::assertions::eventually;
use test_utils::TestMongo;

#[tokio::test]
#[ignore] // Requires Docker
async fn test_duplicate_key_is_classified_from_driver_error() {
    let mongo = TestMongo::new().await;
    let connector = MongoConnector::new(MongoConfig::with_database(&mongo.connection_string, &mongo.database_name));
    let manager = ConnectionManager::new(connector, ConnectionConfig::default());
    manager.connect().await.unwrap();

    let db = mongo.database();
    let insert = |id: i32| {
        let users = db.collection::<Document>("users");
        move |_client: mongodb::Client| {
            let users = users.clone();
            async move { users.insert_one(doc! { "_id": id }).await.map(|_| ()) }
        }
    };

    manager.execute_with_retry(OperationKind::Insert, insert(1)).await.unwrap();
    let err = manager.execute_with_retry(OperationKind::Insert, insert(1)).await.unwrap_err();

    let classification = err.classification();
    assert_eq!(classification.code, "DUPLICATE_KEY");
    assert_eq!(classification.store_code, Some(11000));
    assert!(!classification.retryable);

    let latency = manager.ping().await.unwrap();
    assert!(latency < Duration::from_secs(5));
    manager.disconnect().await;
}

/// Connection manager plus change streams over it, both on the container.
async fn watch_notices(
    mongo: &TestMongo,
) -> (ConnectionManager<MongoConnector>, Arc<ChangeStreamManager>, Arc<Mutex<Vec<ChangeEvent>>>) {
    let connector = MongoConnector::new(MongoConfig::with_database(&mongo.connection_string, &mongo.database_name));
    let connection = ConnectionManager::new(connector, ConnectionConfig::default());
    connection.connect().await.unwrap();

    let manager = Arc::new(
        ChangeStreamManager::new(
            Arc::new(MongoFeedSource::managed(connection.clone())),
            Arc::new(MongoTokenStore::new(connection.clone())),
            ChangeStreamConfig::default()
                .with_collections(["notices"])
                .with_retries(5, 100, 1_000),
        )
        .unwrap(),
    );
    let received = Arc::new(Mutex::new(Vec::<ChangeEvent>::new()));
    let sink = received.clone();
    manager.add_listener("notices", move |event: &ChangeEvent| sink.lock().unwrap().push(event.clone()));
    manager.initialize().await.unwrap();

    let opened = manager.clone();
    eventually(Duration::from_secs(30), "stream active", || {
        let manager = opened.clone();
        async move { manager.status().iter().any(|s| s.active) }
    })
    .await;

    (connection, manager, received)
}

async fn wait_for_events(received: &Arc<Mutex<Vec<ChangeEvent>>>, count: usize) -> Vec<ChangeEvent> {
    let seen = received.clone();
    eventually(Duration::from_secs(30), "events delivered", || {
        let seen = seen.clone();
        async move { seen.lock().unwrap().len() >= count }
    })
    .await;
    received.lock().unwrap().clone()
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_change_stream_delivers_and_persists_tokens() {
    let mongo = TestMongo::new().await;
    let (connection, manager, received) = watch_notices(&mongo).await;

    let notices = mongo.database().collection::<Document>("notices");
    notices.insert_one(doc! { "_id": 1, "title": "hello" }).await.unwrap();
    notices
        .update_one(doc! { "_id": 1 }, doc! { "$set": { "title": "updated" } })
        .await
        .unwrap();

    let events = wait_for_events(&received, 2).await;
    assert_eq!(events[0].operation_type, ChangeOperation::Insert);
    assert_eq!(events[1].operation_type, ChangeOperation::Update);
    assert_eq!(events[1].full_document.as_ref().unwrap()["title"], "updated");

    let tokens = MongoTokenStore::new(connection.clone());
    let stored = tokens.load("notices").await.unwrap();
    assert_eq!(stored.as_ref(), Some(&events[1].resume_token));
    manager.close().await;
    connection.disconnect().await;
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_change_stream_survives_connection_recovery() {
    let mongo = TestMongo::new().await;
    let (connection, manager, received) = watch_notices(&mongo).await;

    let notices = mongo.database().collection::<Document>("notices");
    notices.insert_one(doc! { "_id": 1 }).await.unwrap();
    wait_for_events(&received, 1).await;

    tokio::time::timeout(Duration::from_secs(30), connection.reconnect())
        .await
        .expect("reconnect must not wait on open cursors")
        .unwrap();

    notices.insert_one(doc! { "_id": 2 }).await.unwrap();
    let events = wait_for_events(&received, 2).await;
    assert_eq!(events.last().unwrap().document_key, Some(serde_json::json!({ "_id": 2 })));

    let status = manager.status();
    assert!(status.iter().all(|s| !s.failed));

    let tokens = MongoTokenStore::new(connection.clone());
    let stored = tokens.load("notices").await.unwrap();
    assert_eq!(stored.as_ref(), Some(&events.last().unwrap().resume_token));
    manager.close().await;
    connection.disconnect().await;
}
