//! Push pipeline: transmits queued writes.
//!
//! Push invocations for the same collection form a chain: an invocation
//! waits until everything the previous one had in flight has completed,
//! then snapshots the queue. Within one invocation transmissions run
//! concurrently, bounded by the client-wide worker pool.

use crate::network::Network;
use crate::request::{CompositeRequest, Request, TaskRequest};
use crate::response;
use futures::future::{BoxFuture, FutureExt, Shared};
use offsync_core::{
    is_temporary_id, Cache, DataStoreError, DataStoreResult, Entity, PendingMethod,
    PendingOperation, SyncQueue,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};
use uuid::Uuid;

/// Outcome of a push.
#[derive(Debug, Clone, Default)]
pub struct PushResult {
    /// Number of records the server acknowledged.
    pub count: u64,
    /// Errors of the transmissions that failed.
    pub errors: Vec<DataStoreError>,
}

impl PushResult {
    /// Returns true if every transmission succeeded.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Detailed outcome of a push, including the server copies.
#[derive(Debug, Default)]
pub(crate) struct PushReport {
    pub count: u64,
    pub errors: Vec<DataStoreError>,
    pub attempted: usize,
    pub saved: Vec<Entity>,
}

impl From<PushReport> for PushResult {
    fn from(report: PushReport) -> Self {
        Self {
            count: report.count,
            errors: report.errors,
        }
    }
}

type Completion = Shared<BoxFuture<'static, ()>>;

/// Number of transmitted writes whose server copies stay claimable.
const SETTLED_CAPACITY: usize = 256;

/// Held by every task of a push invocation; the invocation is complete
/// once the last clone is dropped.
#[derive(Clone)]
pub(crate) struct InFlight {
    _done: Arc<oneshot::Sender<()>>,
}

/// Chains push invocations per collection.
#[derive(Default)]
pub(crate) struct PushSequencer {
    tails: Mutex<HashMap<String, Completion>>,
    settled: Mutex<VecDeque<(Uuid, Entity)>>,
}

impl PushSequencer {
    /// Registers a new invocation.
    ///
    /// Returns the completion of the previous invocation (if any) and the
    /// in-flight token of the new one. The new invocation completes only
    /// after the previous one has, even if it is cancelled while waiting.
    pub fn begin(&self, collection: &str) -> (Option<Completion>, InFlight) {
        let (done, released) = oneshot::channel::<()>();
        let mut tails = self.tails.lock();
        let previous = tails.remove(collection);
        let after = previous.clone();
        let completion = async move {
            if let Some(previous) = after {
                previous.await;
            }
            let _ = released.await;
        }
        .boxed()
        .shared();
        tails.insert(collection.to_string(), completion);
        (
            previous,
            InFlight {
                _done: Arc::new(done),
            },
        )
    }

    /// Records the server copy of a transmitted write.
    fn settle(&self, operation: Uuid, entity: Entity) {
        let mut settled = self.settled.lock();
        if settled.len() == SETTLED_CAPACITY {
            settled.pop_front();
        }
        settled.push_back((operation, entity));
    }

    /// Claims the server copy of a write transmitted by an earlier push.
    pub fn take_settled(&self, operation: Uuid) -> Option<Entity> {
        let mut settled = self.settled.lock();
        let index = settled.iter().position(|(id, _)| *id == operation)?;
        settled.remove(index).map(|(_, entity)| entity)
    }
}

struct Transmitted {
    count: u64,
    entity: Option<Entity>,
}

/// Transmits the pending operations of one collection.
#[derive(Clone)]
pub(crate) struct PushPipeline {
    network: Arc<Network>,
    collection: String,
    cache: Option<Arc<dyn Cache>>,
    sync_queue: Arc<dyn SyncQueue>,
    sequencer: Arc<PushSequencer>,
    workers: Arc<Semaphore>,
}

impl PushPipeline {
    pub fn new(
        network: Arc<Network>,
        collection: impl Into<String>,
        cache: Option<Arc<dyn Cache>>,
        sync_queue: Arc<dyn SyncQueue>,
        sequencer: Arc<PushSequencer>,
        workers: Arc<Semaphore>,
    ) -> Self {
        Self {
            network,
            collection: collection.into(),
            cache,
            sync_queue,
            sequencer,
            workers,
        }
    }

    /// Claims the server copy of a write transmitted by this or an earlier
    /// push of the client.
    pub fn take_settled(&self, operation: Uuid) -> Option<Entity> {
        self.sequencer.take_settled(operation)
    }

    /// Transmits the queued operations, or only `selection` of them.
    ///
    /// Operations named in `selection` that are no longer queued (a
    /// concurrent push already transmitted them) are skipped.
    pub async fn push(
        &self,
        selection: Option<&[Uuid]>,
        parent: &Arc<CompositeRequest>,
    ) -> DataStoreResult<PushReport> {
        let (previous, in_flight) = self.sequencer.begin(&self.collection);
        if let Some(previous) = previous {
            previous.await;
        }
        if parent.is_cancelled() {
            return Err(DataStoreError::Cancelled);
        }

        let mut pending = self.sync_queue.pending_operations(&self.collection)?;
        if let Some(selection) = selection {
            pending.retain(|operation| selection.contains(&operation.id));
        }
        tracing::info!(collection = %self.collection, pending = pending.len(), "push started");

        let mut report = PushReport {
            attempted: pending.len(),
            ..PushReport::default()
        };
        let mut tasks = Vec::with_capacity(pending.len());
        for operation in pending {
            let request = TaskRequest::new(format!("push {}", operation.request));
            parent.add(Arc::clone(&request) as Arc<dyn Request>);

            let pipeline = self.clone();
            let parent = Arc::clone(parent);
            let in_flight = in_flight.clone();
            let handle = tokio::spawn(async move {
                let _in_flight = in_flight;
                let _permit = Arc::clone(&pipeline.workers)
                    .acquire_owned()
                    .await
                    .map_err(|_| DataStoreError::Cancelled)?;
                pipeline.transmit(operation, &parent).await
            });
            request.attach(handle.abort_handle());
            tasks.push((request, handle));
        }
        drop(in_flight);

        for (request, handle) in tasks {
            let outcome = handle.await;
            request.finish();
            match outcome {
                Ok(Ok(transmitted)) => {
                    report.count += transmitted.count;
                    report.saved.extend(transmitted.entity);
                }
                Ok(Err(err)) => report.errors.push(err),
                Err(err) if err.is_cancelled() => report.errors.push(DataStoreError::Cancelled),
                Err(err) => report
                    .errors
                    .push(DataStoreError::Transport(format!("push task failed: {err}"))),
            }
        }

        tracing::info!(
            collection = %self.collection,
            count = report.count,
            errors = report.errors.len(),
            "push finished"
        );
        Ok(report)
    }

    async fn transmit(
        &self,
        operation: PendingOperation,
        parent: &CompositeRequest,
    ) -> DataStoreResult<Transmitted> {
        let body = match self
            .network
            .send_json(operation.request.clone(), parent)
            .await
        {
            Ok(body) => body,
            Err(err) if err.is_insufficient_credentials() => {
                self.sync_queue.remove(&operation)?;
                tracing::warn!(
                    collection = %self.collection,
                    operation = %operation.id,
                    "dropping pending operation: insufficient credentials"
                );
                return Err(err);
            }
            Err(err) => {
                tracing::debug!(
                    collection = %self.collection,
                    operation = %operation.id,
                    error = %err,
                    "pending operation kept for retry"
                );
                return Err(err);
            }
        };

        match operation.method {
            PendingMethod::Delete => {
                let count = response::count_of(&body).ok_or_else(|| {
                    DataStoreError::invalid_response(200, "missing count in delete response")
                })?;
                self.sync_queue.remove(&operation)?;
                Ok(Transmitted {
                    count,
                    entity: None,
                })
            }
            PendingMethod::Create | PendingMethod::Update => {
                let entity = Entity::from_server_record(body)?;
                let local = if self.sync_queue.remove(&operation)? {
                    Some(entity.clone())
                } else {
                    match operation.object_id.as_deref().filter(|id| is_temporary_id(id)) {
                        Some(temporary_id) => self.rebase_pending(temporary_id, &entity)?,
                        // The later write stays queued and the cache keeps its copy.
                        None => {
                            self.sequencer.settle(operation.id, entity.clone());
                            return Ok(Transmitted {
                                count: 1,
                                entity: Some(entity),
                            });
                        }
                    }
                };
                if let Some(cache) = &self.cache {
                    if let Some(object_id) = &operation.object_id {
                        cache.remove(&Entity::with_id(object_id.clone()))?;
                    }
                    if let Some(local) = local {
                        cache.save(local)?;
                    }
                }
                self.sequencer.settle(operation.id, entity.clone());
                Ok(Transmitted {
                    count: 1,
                    entity: Some(entity),
                })
            }
        }
    }

    /// Re-targets the write queued for a temporary id while its create was
    /// in flight at the server-assigned id.
    ///
    /// A later save becomes an update of the created record and keeps its
    /// queue key; a later removal becomes a delete of it. Returns the copy
    /// to cache.
    fn rebase_pending(
        &self,
        temporary_id: &str,
        created: &Entity,
    ) -> DataStoreResult<Option<Entity>> {
        let Some(server_id) = created.id() else {
            return Err(DataStoreError::ObjectIdMissing);
        };
        let later = self
            .sync_queue
            .pending_operations(&self.collection)?
            .into_iter()
            .find(|queued| queued.object_id.as_deref() == Some(temporary_id));

        let Some(later) = later else {
            tracing::debug!(
                collection = %self.collection,
                id = server_id,
                "record removed while its create was in flight"
            );
            let spec = self.network.factory().remove_by_id(&self.collection, server_id);
            self.sync_queue.enqueue(PendingOperation::new(
                self.collection.as_str(),
                Some(server_id.to_string()),
                spec,
            ))?;
            return Ok(None);
        };

        let mut edited = match later.request.body.clone() {
            Some(body) => Entity::from_value(body)?,
            None => Entity::new(),
        };
        edited.set_id(server_id);
        if let Some(metadata) = created.metadata() {
            edited.set_metadata(&metadata)?;
        }
        let spec = self.network.factory().save(&self.collection, &edited);
        let rebased = PendingOperation {
            id: later.id,
            ..PendingOperation::new(self.collection.as_str(), Some(server_id.to_string()), spec)
        };
        tracing::debug!(
            collection = %self.collection,
            id = server_id,
            "write queued during create rebased onto the server id"
        );
        self.sync_queue.replace(&later, rebased)?;
        Ok(Some(edited))
    }
}
