//! Record fixtures and client helpers.

use crate::backend::MemoryBackend;
use chrono::DateTime;
use offsync_core::{DataStoreResult, Entity, FileSyncQueue, SyncQueue};
use offsync_engine::{Client, ClientConfig, Transport};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

/// Seconds since the epoch of tick zero (2016-01-01T00:00:00Z).
const EPOCH_SECONDS: i64 = 1_451_606_400;

/// Returns the service timestamp of a logical clock tick.
///
/// Later ticks give lexicographically greater timestamps.
pub fn timestamp(tick: u64) -> String {
    let seconds = EPOCH_SECONDS + i64::try_from(tick).unwrap_or(i64::MAX / 2);
    DateTime::from_timestamp(seconds, 0)
        .expect("tick out of range")
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

/// Creates a server record with an id and a last-modified time.
pub fn record(id: &str, tick: u64) -> Entity {
    Entity::from_value(json!({
        "_id": id,
        "_kmd": {"lmt": timestamp(tick), "ect": timestamp(tick)}
    }))
    .expect("fixture record is an object")
}

/// Creates `count` server records `{prefix}00000`, `{prefix}00001`, ...
/// each with a `seq` field holding its position.
pub fn numbered_records(prefix: &str, count: usize) -> Vec<Entity> {
    (0..count)
        .map(|seq| {
            let mut entity = record(&format!("{prefix}{seq:05}"), 1);
            entity.set("seq", seq);
            entity
        })
        .collect()
}

/// Returns the ids of entities, in order.
pub fn ids_of(entities: &[Entity]) -> Vec<String> {
    entities
        .iter()
        .filter_map(|entity| entity.id().map(str::to_string))
        .collect()
}

/// Creates a backend and a caching client talking to it.
pub fn memory_client() -> (Arc<MemoryBackend>, Client) {
    memory_client_with(|config| config)
}

/// Creates a backend and a caching client whose configuration is adjusted
/// by `configure`.
pub fn memory_client_with(
    configure: impl FnOnce(ClientConfig) -> ClientConfig,
) -> (Arc<MemoryBackend>, Client) {
    let backend = Arc::new(MemoryBackend::new("kid_test"));
    let client = Client::builder()
        .config(configure(ClientConfig::new(backend.app_key())))
        .transport(Arc::clone(&backend) as Arc<dyn Transport>)
        .build()
        .expect("client configuration is valid");
    (backend, client)
}

/// Creates a client that persists its sync queue in `path`.
pub fn client_with_file_queue(
    backend: &Arc<MemoryBackend>,
    path: &Path,
) -> DataStoreResult<Client> {
    let queue = FileSyncQueue::open(path)?;
    Client::builder()
        .config(ClientConfig::new(backend.app_key()))
        .transport(Arc::clone(backend) as Arc<dyn Transport>)
        .sync_queue(Arc::new(queue) as Arc<dyn SyncQueue>)
        .build()
}
