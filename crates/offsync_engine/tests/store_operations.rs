//! Data store operations under each policy, the typed facade and the client
//! lifecycle.

use offsync_engine::{
    DataStoreError, Entity, FieldMapping, Filter, Persistable, Query, ReadPolicy, Transform,
    WritePolicy,
};
use offsync_testkit::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Book {
    id: Option<String>,
    title: String,
    pages: u32,
    updated_at: Option<i64>,
}

impl Persistable for Book {
    const COLLECTION: &'static str = "books";
    const FIELDS: &'static [FieldMapping] = &[
        FieldMapping::new("id", "_id"),
        FieldMapping::new("title", "name"),
        FieldMapping::new("pages", "pages"),
        FieldMapping::new("updated_at", "_kmd.lmt").with_transform(Transform::EPOCH_MILLIS_AS_RFC3339),
    ];
}

fn book(title: &str, pages: u32) -> Book {
    Book {
        id: None,
        title: title.to_string(),
        pages,
        updated_at: None,
    }
}

#[tokio::test]
async fn typed_store_round_trips_through_the_server() {
    let (backend, client) = memory_client();
    let books = client.typed::<Book>();

    let saved = books
        .save_with_policy(&book("Dune", 412), WritePolicy::NetworkOnly)
        .last()
        .await
        .unwrap();
    let id = saved.id.clone().unwrap();
    assert!(saved.updated_at.is_some());

    let stored = backend.get("books", &id).unwrap();
    assert_eq!(stored.get("name"), Some(&serde_json::json!("Dune")));
    assert_eq!(stored.get("title"), None);

    let found = books
        .find_with_policy(Query::filtered(Filter::gt("pages", 400)), ReadPolicy::NetworkOnly)
        .last()
        .await
        .unwrap();
    assert_eq!(found, vec![saved.clone()]);

    let by_id = books
        .find_by_id_with_policy(id, ReadPolicy::LocalOnly)
        .last()
        .await
        .unwrap();
    assert_eq!(by_id, Some(saved));
}

#[tokio::test]
async fn typed_local_then_network_save_delivers_both_copies() {
    let (_backend, client) = memory_client();
    let books = client.typed::<Book>();

    let results = books.save(&book("Emma", 320)).collect().await;
    let local = results[0].as_ref().unwrap();
    let remote = results[1].as_ref().unwrap();
    assert!(local.id.as_deref().is_some_and(offsync_core::is_temporary_id));
    assert!(remote.id.as_deref().is_some_and(|id| !offsync_core::is_temporary_id(id)));
    assert_eq!(books.sync_count().unwrap(), 0);
}

#[tokio::test]
async fn find_by_id_reads_through_to_the_server() {
    let (backend, client) = memory_client();
    backend.seed("books", vec![record("b1", 1)]);
    let store = client.collection("books");

    let results = store.find_by_id("b1").collect().await;
    assert!(matches!(results[0], Ok(None)));
    assert_eq!(results[1].as_ref().unwrap().as_ref().unwrap().id(), Some("b1"));
    assert!(client.cache("books").unwrap().find_by_id("b1").unwrap().is_some());

    let missing = store
        .find_by_id_with_policy("nope", ReadPolicy::NetworkOnly)
        .last()
        .await;
    assert!(matches!(missing, Err(DataStoreError::EntityNotFound { .. })));
}

#[tokio::test]
async fn network_only_remove_by_query_reports_server_count() {
    let (backend, client) = memory_client();
    let mut short = record("b1", 1);
    short.set("pages", 90);
    let mut long = record("b2", 1);
    long.set("pages", 900);
    backend.seed("books", vec![short.clone(), long.clone()]);
    client.cache("books").unwrap().save_all(vec![short, long]).unwrap();

    let removed = client
        .collection("books")
        .remove_with_policy(Query::filtered(Filter::lt("pages", 100)), WritePolicy::NetworkOnly)
        .last()
        .await
        .unwrap();

    assert_eq!(removed, 1);
    assert!(backend.get("books", "b1").is_none());
    let cache = client.cache("books").unwrap();
    assert!(cache.find_by_id("b1").unwrap().is_none());
    assert!(cache.find_by_id("b2").unwrap().is_some());
}

#[tokio::test]
async fn local_then_network_remove_pushes_the_deletes() {
    let (backend, client) = memory_client();
    let records = vec![record("b1", 1), record("b2", 1), record("b3", 1)];
    backend.seed("books", records.clone());
    client.cache("books").unwrap().save_all(records).unwrap();
    let store = client.collection("books");

    let results = store
        .remove(Query::filtered(Filter::ne("_id", "b2")))
        .collect()
        .await;

    assert_eq!(results[0].as_ref().unwrap(), &2);
    assert_eq!(results[1].as_ref().unwrap(), &2);
    assert_eq!(ids_of(&backend.records("books")), vec!["b2"]);
    assert_eq!(store.sync_count().unwrap(), 0);
}

#[tokio::test]
async fn offline_writes_stay_queued() {
    let (backend, client) = memory_client();
    backend.fail_with(
        RequestMatcher::any(),
        DataStoreError::Transport("connection refused".into()),
        1,
    );
    let store = client.collection("books");

    let results = store.save(record("b1", 1)).collect().await;
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(DataStoreError::Transport(_))));
    assert_eq!(store.sync_count().unwrap(), 1);

    let pushed = store.push().last().await.unwrap();
    assert_eq!(pushed.count, 1);
    assert!(backend.get("books", "b1").is_some());
}

#[tokio::test]
async fn slow_requests_time_out() {
    let (backend, client) =
        memory_client_with(|config| config.with_request_timeout(Duration::from_millis(50)));
    backend.set_latency(Duration::from_millis(500));

    let result = client
        .collection("books")
        .find_with_policy(Query::new(), ReadPolicy::NetworkOnly)
        .last()
        .await;
    assert!(matches!(result, Err(DataStoreError::Timeout)));
}

#[tokio::test]
async fn clear_cache_empties_one_collection() {
    let (_backend, client) = memory_client();
    client.cache("books").unwrap().save(record("b1", 1)).unwrap();
    client.cache("authors").unwrap().save(record("a1", 1)).unwrap();

    client.collection("books").clear_cache().unwrap();
    assert!(client.cache("books").unwrap().is_empty().unwrap());
    assert!(!client.cache("authors").unwrap().is_empty().unwrap());

    client.clear_caches().unwrap();
    assert!(client.cache("authors").unwrap().is_empty().unwrap());
}

#[tokio::test]
async fn shutdown_cancels_outstanding_operations() {
    let (backend, client) = memory_client();
    backend.set_latency(Duration::from_secs(30));
    let store = client.collection("books");

    let pending = store.find_with_policy(Query::new(), ReadPolicy::NetworkOnly);
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.shutdown();

    assert!(pending.is_cancelled());
    assert!(matches!(pending.last().await, Err(DataStoreError::Cancelled)));
    assert!(matches!(
        store.push().last().await,
        Err(DataStoreError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn uncached_clients_go_to_the_network() {
    let backend = std::sync::Arc::new(MemoryBackend::new("kid_test"));
    backend.seed("books", vec![record("b1", 1)]);
    let client = offsync_engine::Client::builder()
        .config(offsync_engine::ClientConfig::new("kid_test"))
        .transport(std::sync::Arc::clone(&backend) as std::sync::Arc<dyn offsync_engine::Transport>)
        .without_cache()
        .build()
        .unwrap();

    let found = client
        .collection("books")
        .find_with_policy(Query::new(), ReadPolicy::NetworkOnly)
        .last()
        .await
        .unwrap();
    assert_eq!(ids_of(&found), vec!["b1"]);

    let mut draft = Entity::new();
    draft.set("title", "Dune");
    let local = client
        .collection("books")
        .save_with_policy(draft, WritePolicy::LocalOnly)
        .last()
        .await;
    assert!(matches!(local, Err(DataStoreError::InvalidOperation(_))));
}
