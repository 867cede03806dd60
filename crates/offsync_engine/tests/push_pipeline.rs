//! Push pipeline behaviour against the in-memory backend.

use offsync_core::{Entity, HttpMethod, Query, WritePolicy};
use offsync_engine::{AuthFailure, DataStoreError};
use offsync_testkit::prelude::*;
use std::time::Duration;

fn titled(id: &str, title: &str) -> Entity {
    let mut entity = Entity::with_id(id);
    entity.set("title", title);
    entity
}

async fn save_locally(store: &offsync_engine::DataStore, entity: Entity) -> Entity {
    store
        .save_with_policy(entity, WritePolicy::LocalOnly)
        .last()
        .await
        .unwrap()
}

#[tokio::test]
async fn push_is_idempotent() {
    init_tracing();
    let (backend, client) = memory_client();
    let store = client.collection("books");
    for n in 0..3 {
        save_locally(&store, titled(&format!("b{n}"), "Dune")).await;
    }

    let first = store.push().last().await.unwrap();
    assert_eq!(first.count, 3);
    assert!(first.errors.is_empty());
    assert_eq!(backend.len("books"), 3);

    let second = store.push().last().await.unwrap();
    assert_eq!(second.count, 0);
    assert!(second.errors.is_empty());
    assert_eq!(backend.request_count(), 3);
}

#[tokio::test]
async fn partial_failure_keeps_only_the_failed_write() {
    let (backend, client) = memory_client();
    let store = client.collection("books");
    for n in 1..=3 {
        save_locally(&store, titled(&format!("b{n}"), "Dune")).await;
    }
    backend.fail_once(RequestMatcher::any().path_contains("/books/b2"), 500, "ServerError");

    let first = store.push().last().await.unwrap();
    assert_eq!(first.count, 2);
    assert_eq!(first.errors.len(), 1);
    assert_eq!(store.sync_count().unwrap(), 1);

    backend.clear_requests();
    let retry = store.push().last().await.unwrap();
    assert_eq!(retry.count, 1);
    assert!(retry.errors.is_empty());
    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].path.ends_with("/books/b2"));
    assert_eq!(store.sync_count().unwrap(), 0);
}

#[tokio::test]
async fn insufficient_credentials_drop_the_write() {
    let (backend, client) = memory_client();
    let store = client.collection("books");
    save_locally(&store, titled("b1", "Dune")).await;
    backend.fail_once(RequestMatcher::any(), 401, "InsufficientCredentials");

    let result = store.push().last().await.unwrap();
    assert_eq!(result.count, 0);
    assert!(matches!(
        result.errors.as_slice(),
        [DataStoreError::Unauthorized {
            reason: AuthFailure::InsufficientCredentials,
            ..
        }]
    ));
    assert_eq!(store.sync_count().unwrap(), 0);

    let again = store.push().last().await.unwrap();
    assert_eq!(again.count, 0);
    assert_eq!(backend.request_count(), 1);
}

#[tokio::test]
async fn other_auth_failures_keep_the_write() {
    let (backend, client) = memory_client();
    let store = client.collection("books");
    save_locally(&store, titled("b1", "Dune")).await;
    backend.fail_once(RequestMatcher::any(), 401, "InvalidCredentials");

    let result = store.push().last().await.unwrap();
    assert_eq!(result.errors.len(), 1);
    assert_eq!(store.sync_count().unwrap(), 1);
}

#[tokio::test]
async fn concurrent_pushes_never_transmit_twice() {
    let (backend, client) = memory_client_with(|config| config.with_push_concurrency(2));
    backend.set_latency(Duration::from_millis(30));
    let store = client.collection("books");
    for n in 0..6 {
        save_locally(&store, titled(&format!("b{n}"), "Dune")).await;
    }

    let first = store.push();
    let second = store.push();
    let (first, second) = tokio::join!(first.last(), second.last());
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.count + second.count, 6);
    assert!(first.errors.is_empty() && second.errors.is_empty());
    assert_eq!(backend.request_count(), 6);
    assert_eq!(store.sync_count().unwrap(), 0);
}

#[tokio::test]
async fn pushes_to_different_collections_run_independently() {
    let (backend, client) = memory_client();
    let books = client.collection("books");
    let authors = client.collection("authors");
    save_locally(&books, titled("b1", "Dune")).await;
    save_locally(&authors, titled("a1", "Herbert")).await;
    backend.delay(
        RequestMatcher::any().path_contains("/books/"),
        Duration::from_millis(300),
    );

    let slow = books.push();
    let fast = authors.push().last().await.unwrap();
    assert_eq!(fast.count, 1);
    assert_eq!(books.sync_count().unwrap(), 1);
    assert_eq!(slow.last().await.unwrap().count, 1);
}

#[tokio::test]
async fn pushed_create_replaces_the_temporary_copy() {
    let (backend, client) = memory_client();
    let store = client.collection("books");
    let mut draft = Entity::new();
    draft.set("title", "Dune");
    let local = save_locally(&store, draft).await;
    assert!(local.is_temporary());

    let result = store.push().last().await.unwrap();
    assert_eq!(result.count, 1);

    let cache = client.cache("books").unwrap();
    assert!(cache.find_by_id(local.id().unwrap()).unwrap().is_none());
    let cached = cache.find(&Query::new()).unwrap();
    assert_eq!(cached.len(), 1);
    assert!(!cached[0].is_temporary());
    assert!(backend.get("books", cached[0].id().unwrap()).is_some());

    let create = &backend.requests()[0];
    assert_eq!(create.method, HttpMethod::Post);
    assert!(create.body.as_ref().unwrap().get("_id").is_none());
}

#[tokio::test]
async fn pushed_delete_counts_server_removals() {
    let (backend, client) = memory_client();
    backend.seed("books", vec![record("b1", 1), record("b2", 1)]);
    let store = client.collection("books");
    client
        .cache("books")
        .unwrap()
        .save_all(vec![record("b1", 1), record("b2", 1)])
        .unwrap();

    let removed = store
        .remove_by_id_with_policy("b1", WritePolicy::LocalOnly)
        .last()
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let result = store.push().last().await.unwrap();
    assert_eq!(result.count, 1);
    assert!(backend.get("books", "b1").is_none());
    assert!(backend.get("books", "b2").is_some());
}

#[tokio::test]
async fn create_then_delete_never_reaches_the_server() {
    let (backend, client) = memory_client();
    let store = client.collection("books");
    let mut draft = Entity::new();
    draft.set("title", "Dune");
    let local = save_locally(&store, draft).await;

    let mut edited = local.clone();
    edited.set("title", "Dune Messiah");
    save_locally(&store, edited).await;
    assert_eq!(store.sync_count().unwrap(), 1);

    store
        .remove_by_id_with_policy(local.id().unwrap(), WritePolicy::LocalOnly)
        .last()
        .await
        .unwrap();
    assert_eq!(store.sync_count().unwrap(), 0);

    let result = store.push().last().await.unwrap();
    assert_eq!(result.count, 0);
    assert_eq!(backend.request_count(), 0);
}

#[tokio::test]
async fn create_then_update_sends_the_latest_body() {
    let (backend, client) = memory_client();
    let store = client.collection("books");
    let mut draft = Entity::new();
    draft.set("title", "Dune");
    let local = save_locally(&store, draft).await;
    let mut edited = local.clone();
    edited.set("title", "Dune Messiah");
    save_locally(&store, edited).await;

    store.push().last().await.unwrap();

    let stored = backend.records("books");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].get("title"), Some(&serde_json::json!("Dune Messiah")));
}

#[tokio::test]
async fn local_then_network_save_reconciles_ids() {
    let (backend, client) = memory_client();
    let store = client.collection("books");
    let mut draft = Entity::new();
    draft.set("title", "Dune");

    let results = store.save(draft).collect().await;
    assert_eq!(results.len(), 2);
    let local = results[0].as_ref().unwrap();
    let remote = results[1].as_ref().unwrap();
    assert!(local.is_temporary());
    assert!(!remote.is_temporary());
    assert_eq!(backend.len("books"), 1);
    assert_eq!(store.sync_count().unwrap(), 0);

    let cache = client.cache("books").unwrap();
    assert!(cache.find_by_id(remote.id().unwrap()).unwrap().is_some());
    assert_eq!(cache.count(&Query::new()).unwrap(), 1);
}

#[tokio::test]
async fn sync_pushes_then_pulls() {
    let (backend, client) = memory_client();
    backend.seed("books", vec![record("b1", 1)]);
    let store = client.collection("books");
    save_locally(&store, titled("b2", "Emma")).await;

    let result = store.sync(Query::new()).last().await.unwrap();
    assert_eq!(result.pushed, 1);
    assert!(result.errors.is_empty());
    let mut pulled = ids_of(&result.pulled);
    pulled.sort();
    assert_eq!(pulled, vec!["b1", "b2"]);
}

#[tokio::test]
async fn pull_waits_for_pending_writes() {
    let (_backend, client) = memory_client();
    let store = client.collection("books");
    save_locally(&store, titled("b1", "Dune")).await;

    let rejected = store.pull(Query::new()).last().await;
    assert!(matches!(rejected, Err(DataStoreError::InvalidOperation(_))));

    store.push().last().await.unwrap();
    let pulled = store.pull(Query::new()).last().await.unwrap();
    assert_eq!(ids_of(&pulled), vec!["b1"]);
}

#[tokio::test]
async fn purge_restores_server_state() {
    let (backend, client) = memory_client();
    backend.seed("books", vec![titled("b1", "Dune"), titled("b2", "Emma")]);
    let store = client.collection("books");
    store
        .find_with_policy(Query::new(), offsync_core::ReadPolicy::NetworkOnly)
        .last()
        .await
        .unwrap();

    save_locally(&store, titled("b1", "Dune (edited)")).await;
    store
        .remove_by_id_with_policy("b2", WritePolicy::LocalOnly)
        .last()
        .await
        .unwrap();
    let draft = save_locally(&store, Entity::new()).await;
    assert_eq!(store.sync_count().unwrap(), 3);

    let purged = store.purge().last().await.unwrap();
    assert_eq!(purged, 3);
    assert_eq!(store.sync_count().unwrap(), 0);

    let cache = client.cache("books").unwrap();
    let restored = cache.find_by_id("b1").unwrap().unwrap();
    assert_eq!(restored.get("title"), Some(&serde_json::json!("Dune")));
    assert!(cache.find_by_id("b2").unwrap().is_some());
    assert!(cache.find_by_id(draft.id().unwrap()).unwrap().is_none());
}

#[tokio::test]
async fn pending_writes_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.json");
    let backend = std::sync::Arc::new(MemoryBackend::new("kid_test"));

    {
        let client = client_with_file_queue(&backend, &path).unwrap();
        let store = client.collection("books");
        save_locally(&store, titled("b1", "Dune")).await;
        assert_eq!(store.sync_count().unwrap(), 1);
    }

    let client = client_with_file_queue(&backend, &path).unwrap();
    let store = client.collection("books");
    assert_eq!(store.sync_count().unwrap(), 1);
    let result = store.push().last().await.unwrap();
    assert_eq!(result.count, 1);
    assert!(backend.get("books", "b1").is_some());
}

async fn wait_for_requests(backend: &MemoryBackend, count: usize) {
    while backend.request_count() < count {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

fn draft(title: &str) -> Entity {
    let mut entity = Entity::new();
    entity.set("title", title);
    entity
}

#[tokio::test]
async fn cancelled_waiting_push_keeps_later_pushes_in_line() {
    let (backend, client) = memory_client();
    let store = client.collection("books");
    save_locally(&store, titled("b1", "Dune")).await;
    backend.delay(
        RequestMatcher::any().path_contains("/books/b1"),
        Duration::from_millis(300),
    );

    let first = store.push();
    wait_for_requests(&backend, 1).await;
    let second = store.push();
    tokio::time::sleep(Duration::from_millis(20)).await;
    second.cancel();
    let third = store.push();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.request_count(), 1);

    assert_eq!(first.last().await.unwrap().count, 1);
    assert!(matches!(second.last().await, Err(DataStoreError::Cancelled)));
    assert_eq!(third.last().await.unwrap().count, 0);
    assert_eq!(backend.request_count(), 1);
}

#[tokio::test]
async fn cancelled_push_keeps_untransmitted_writes() {
    let (backend, client) = memory_client_with(|config| config.with_push_concurrency(1));
    backend.set_latency(Duration::from_millis(200));
    let store = client.collection("books");
    for n in 0..3 {
        save_locally(&store, titled(&format!("b{n}"), "Dune")).await;
    }

    let push = store.push();
    wait_for_requests(&backend, 1).await;
    push.cancel();
    assert!(push.is_cancelled());
    assert!(matches!(push.last().await, Err(DataStoreError::Cancelled)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(backend.request_count(), 1);
    assert_eq!(backend.len("books"), 0);
    assert_eq!(store.sync_count().unwrap(), 3);

    backend.set_latency(Duration::ZERO);
    let retry = store.push().last().await.unwrap();
    assert_eq!(retry.count, 3);
    assert_eq!(store.sync_count().unwrap(), 0);
}

#[tokio::test]
async fn push_concurrency_bounds_transmissions_across_collections() {
    let (backend, client) = memory_client_with(|config| config.with_push_concurrency(2));
    backend.set_latency(Duration::from_millis(30));
    let books = client.collection("books");
    let authors = client.collection("authors");
    for n in 0..3 {
        save_locally(&books, titled(&format!("b{n}"), "Dune")).await;
        save_locally(&authors, titled(&format!("a{n}"), "Herbert")).await;
    }

    let (books_result, authors_result) = tokio::join!(books.push().last(), authors.push().last());
    assert_eq!(books_result.unwrap().count, 3);
    assert_eq!(authors_result.unwrap().count, 3);
    assert_eq!(backend.request_count(), 6);
    assert_eq!(backend.peak_in_flight(), 2);
}

#[tokio::test]
async fn editing_during_create_updates_the_created_record() {
    let (backend, client) = memory_client();
    let store = client.collection("books");
    let local = save_locally(&store, draft("Dune")).await;
    backend.delay(
        RequestMatcher::any().method(HttpMethod::Post),
        Duration::from_millis(200),
    );

    let first = store.push();
    wait_for_requests(&backend, 1).await;
    let mut edited = local.clone();
    edited.set("title", "Dune Messiah");
    save_locally(&store, edited).await;

    let first = first.last().await.unwrap();
    assert_eq!(first.count, 1);
    assert!(first.errors.is_empty());
    assert_eq!(store.sync_count().unwrap(), 1);

    let second = store.push().last().await.unwrap();
    assert_eq!(second.count, 1);
    assert_eq!(store.sync_count().unwrap(), 0);

    let stored = backend.records("books");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].get("title"), Some(&serde_json::json!("Dune Messiah")));
    assert_eq!(backend.requests()[1].method, HttpMethod::Put);

    let cached = client.cache("books").unwrap().find(&Query::new()).unwrap();
    assert_eq!(ids_of(&cached), ids_of(&stored));
}

#[tokio::test]
async fn removing_during_create_deletes_the_created_record() {
    let (backend, client) = memory_client();
    let store = client.collection("books");
    let local = save_locally(&store, draft("Dune")).await;
    backend.delay(
        RequestMatcher::any().method(HttpMethod::Post),
        Duration::from_millis(200),
    );

    let first = store.push();
    wait_for_requests(&backend, 1).await;
    let removed = store
        .remove_by_id_with_policy(local.id().unwrap(), WritePolicy::LocalOnly)
        .last()
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(store.sync_count().unwrap(), 0);

    assert_eq!(first.last().await.unwrap().count, 1);
    assert_eq!(store.sync_count().unwrap(), 1);

    let second = store.push().last().await.unwrap();
    assert_eq!(second.count, 1);
    assert_eq!(backend.len("books"), 0);
    assert!(client.cache("books").unwrap().is_empty().unwrap());
}

#[tokio::test]
async fn local_then_network_save_resolves_a_concurrent_transmission() {
    let (backend, client) = memory_client();
    let store = client.collection("books");
    save_locally(&store, titled("b0", "Emma")).await;
    backend.delay(
        RequestMatcher::any().path_contains("/books/b0"),
        Duration::from_millis(200),
    );

    let blocking = store.push();
    wait_for_requests(&backend, 1).await;
    let concurrent = store.push();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let results = store.save(draft("Dune")).collect().await;
    let local = results[0].as_ref().unwrap();
    let remote = results[1].as_ref().unwrap();
    assert!(local.is_temporary());
    assert!(!remote.is_temporary());
    assert_eq!(remote.get("title"), Some(&serde_json::json!("Dune")));
    assert!(backend.get("books", remote.id().unwrap()).is_some());

    assert_eq!(blocking.last().await.unwrap().count, 1);
    assert_eq!(concurrent.last().await.unwrap().count, 1);
    assert_eq!(backend.len("books"), 2);
    assert_eq!(store.sync_count().unwrap(), 0);
}
