//! Pending-write queue.
//!
//! Writes made under a local write policy are recorded as
//! [`PendingOperation`]s and transmitted later by a push. The queue keeps
//! enqueue order per collection and holds at most one pending operation per
//! target entity:
//!
//! - a `Create` followed by an `Update` stays a `Create` carrying the newer body
//! - a `Create` followed by a `Delete` cancels out (the server never saw it)
//! - anything else replaces the earlier entry
//!
//! A `Delete` of a temporary id with nothing queued is dropped.
//!
//! Removal is keyed by the operation id, so completing an operation that a
//! later enqueue already replaced is a no-op.

use crate::entity::is_temporary_id;
use crate::error::DataStoreResult;
use crate::request::{HttpMethod, RequestSpec};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingMethod {
    /// The entity does not exist on the server yet.
    Create,
    /// The entity exists on the server and was modified locally.
    Update,
    /// The entity (or every entity matching a query) was removed locally.
    Delete,
}

impl PendingMethod {
    /// Infers the kind of a pending write from its request.
    pub fn from_http(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Post => PendingMethod::Create,
            HttpMethod::Delete => PendingMethod::Delete,
            HttpMethod::Put | HttpMethod::Get => PendingMethod::Update,
        }
    }
}

/// A queued write awaiting transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Queue key of the operation.
    pub id: Uuid,
    /// Target collection.
    pub collection: String,
    /// Target entity id; `None` for a delete by query.
    pub object_id: Option<String>,
    /// Kind of write.
    pub method: PendingMethod,
    /// The request to transmit.
    pub request: RequestSpec,
}

impl PendingOperation {
    /// Creates a pending operation with a fresh queue key.
    pub fn new(
        collection: impl Into<String>,
        object_id: Option<String>,
        request: RequestSpec,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            collection: collection.into(),
            object_id,
            method: PendingMethod::from_http(request.method),
            request,
        }
    }
}

/// A durable, per-collection ordered list of pending writes.
pub trait SyncQueue: Send + Sync {
    /// Adds an operation, coalescing with any pending one for the same entity.
    fn enqueue(&self, operation: PendingOperation) -> DataStoreResult<()>;

    /// Returns the pending operations of a collection in enqueue order.
    fn pending_operations(&self, collection: &str) -> DataStoreResult<Vec<PendingOperation>>;

    /// Removes an operation; returns false if it was no longer queued.
    fn remove(&self, operation: &PendingOperation) -> DataStoreResult<bool>;

    /// Removes and returns every pending operation of a collection.
    fn remove_all(&self, collection: &str) -> DataStoreResult<Vec<PendingOperation>>;

    /// Replaces a queued operation, keeping its position when possible;
    /// returns false if it was no longer queued.
    ///
    /// The replacement is stored as given, without coalescing.
    fn replace(
        &self,
        operation: &PendingOperation,
        replacement: PendingOperation,
    ) -> DataStoreResult<bool> {
        if !self.remove(operation)? {
            return Ok(false);
        }
        self.enqueue(replacement)?;
        Ok(true)
    }

    /// Returns the number of pending operations of a collection.
    fn count(&self, collection: &str) -> DataStoreResult<usize> {
        Ok(self.pending_operations(collection)?.len())
    }
}

/// Applies the coalescing rules to a queue held in memory.
pub fn coalesce(queue: &mut Vec<PendingOperation>, operation: PendingOperation) {
    let existing = operation.object_id.as_ref().and_then(|object_id| {
        queue.iter().position(|queued| {
            queued.collection == operation.collection
                && queued.object_id.as_ref() == Some(object_id)
        })
    });

    let Some(index) = existing else {
        let unsent = operation.method == PendingMethod::Delete
            && operation.object_id.as_deref().is_some_and(is_temporary_id);
        if !unsent {
            queue.push(operation);
        }
        return;
    };

    match (queue[index].method, operation.method) {
        (PendingMethod::Create, PendingMethod::Update) => {
            let queued = &mut queue[index];
            queued.id = operation.id;
            queued.request.body = operation.request.body;
        }
        (PendingMethod::Create, PendingMethod::Delete) => {
            queue.remove(index);
        }
        _ => {
            queue.remove(index);
            queue.push(operation);
        }
    }
}

/// A sync queue held in memory.
#[derive(Debug, Default)]
pub struct MemorySyncQueue {
    operations: Mutex<Vec<PendingOperation>>,
}

impl MemorySyncQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncQueue for MemorySyncQueue {
    fn enqueue(&self, operation: PendingOperation) -> DataStoreResult<()> {
        coalesce(&mut self.operations.lock(), operation);
        Ok(())
    }

    fn pending_operations(&self, collection: &str) -> DataStoreResult<Vec<PendingOperation>> {
        Ok(self
            .operations
            .lock()
            .iter()
            .filter(|op| op.collection == collection)
            .cloned()
            .collect())
    }

    fn remove(&self, operation: &PendingOperation) -> DataStoreResult<bool> {
        let mut operations = self.operations.lock();
        let before = operations.len();
        operations.retain(|op| op.id != operation.id);
        Ok(operations.len() != before)
    }

    fn remove_all(&self, collection: &str) -> DataStoreResult<Vec<PendingOperation>> {
        let mut operations = self.operations.lock();
        let (removed, kept): (Vec<_>, Vec<_>) = operations
            .drain(..)
            .partition(|op| op.collection == collection);
        *operations = kept;
        Ok(removed)
    }

    fn replace(
        &self,
        operation: &PendingOperation,
        replacement: PendingOperation,
    ) -> DataStoreResult<bool> {
        let mut operations = self.operations.lock();
        match operations.iter_mut().find(|op| op.id == operation.id) {
            Some(slot) => {
                *slot = replacement;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
