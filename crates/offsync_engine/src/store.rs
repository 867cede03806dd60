//! Data stores: the per-collection operation surface.
//!
//! Every operation runs as its own task and reports through an
//! [`OperationHandle`]. Local-then-network operations deliver the cache's
//! answer first and the network's answer second.

use crate::client::ClientInner;
use crate::config::StoreOptions;
use crate::fetch::FetchMode;
use crate::network::Network;
use crate::operation::{dispatch_read, OperationHandle};
use crate::push::{PushReport, PushResult};
use crate::request::CompositeRequest;
use crate::response;
use offsync_core::{
    is_temporary_id, Cache, DataStoreError, DataStoreResult, Entity, PendingMethod,
    PendingOperation, Persistable, Query, ReadPolicy, SyncQueue, WritePolicy,
};
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of a sync: a push followed by a pull.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    /// Number of records the push transmitted.
    pub pushed: u64,
    /// Records returned by the pull; empty if the pull did not run.
    pub pulled: Vec<Entity>,
    /// Push errors, or the pull error.
    pub errors: Vec<DataStoreError>,
}

/// The local write side of a store.
#[derive(Clone)]
struct Writer {
    network: Arc<Network>,
    collection: String,
    cache: Option<Arc<dyn Cache>>,
    sync_queue: Arc<dyn SyncQueue>,
}

impl Writer {
    fn require_cache(&self) -> DataStoreResult<&Arc<dyn Cache>> {
        self.cache.as_ref().ok_or_else(|| {
            DataStoreError::invalid_operation(format!(
                "local writes to {} need a cache",
                self.collection
            ))
        })
    }

    /// Caches the entity (assigning a temporary id if needed) and queues
    /// its network write.
    fn save_local(&self, mut entity: Entity) -> DataStoreResult<(Entity, PendingOperation)> {
        let cache = self.require_cache()?;
        let id = entity.ensure_id();
        let spec = self.network.factory().save(&self.collection, &entity);
        let operation = PendingOperation::new(self.collection.as_str(), Some(id), spec);
        cache.save(entity.clone())?;
        self.sync_queue.enqueue(operation.clone())?;
        Ok((entity, operation))
    }

    async fn save_remote(
        &self,
        entity: Entity,
        request: &CompositeRequest,
    ) -> DataStoreResult<Entity> {
        let spec = self.network.factory().save(&self.collection, &entity);
        let body = self.network.send_json(spec, request).await?;
        let saved = Entity::from_server_record(body)?;
        if let Some(cache) = &self.cache {
            if entity.is_temporary() {
                cache.remove(&entity)?;
            }
            cache.save(saved.clone())?;
        }
        Ok(saved)
    }

    /// Removes the cached entities in a query's scope and queues a delete
    /// for each one the server knows.
    fn remove_local(&self, query: &Query) -> DataStoreResult<(u64, Vec<Uuid>)> {
        let cache = self.require_cache()?;
        let scope = query.scope();
        let doomed = cache.find(&scope)?;
        let removed = cache.remove_by_query(&scope)?;
        let mut queued = Vec::new();
        for id in doomed.iter().filter_map(Entity::id) {
            if let Some(operation) = self.enqueue_delete(id)? {
                queued.push(operation);
            }
        }
        Ok((removed as u64, queued))
    }

    fn remove_by_id_local(&self, id: &str) -> DataStoreResult<(u64, Vec<Uuid>)> {
        let cache = self.require_cache()?;
        let removed = cache.remove(&Entity::with_id(id))?;
        let queued = self.enqueue_delete(id)?.into_iter().collect();
        Ok((removed as u64, queued))
    }

    /// Queues a delete; a temporary id only cancels its pending create.
    fn enqueue_delete(&self, id: &str) -> DataStoreResult<Option<Uuid>> {
        let spec = self.network.factory().remove_by_id(&self.collection, id);
        let operation = PendingOperation::new(self.collection.as_str(), Some(id.to_string()), spec);
        let key = operation.id;
        self.sync_queue.enqueue(operation)?;
        Ok((!is_temporary_id(id)).then_some(key))
    }

    async fn remove_remote(
        &self,
        query: &Query,
        request: &CompositeRequest,
    ) -> DataStoreResult<u64> {
        let spec = self.network.factory().remove(&self.collection, query);
        let count = response::parse_count(&self.network.send(spec, request).await?)?;
        if let Some(cache) = &self.cache {
            cache.remove_by_query(&query.scope())?;
        }
        Ok(count)
    }

    async fn remove_by_id_remote(
        &self,
        id: &str,
        request: &CompositeRequest,
    ) -> DataStoreResult<u64> {
        let spec = self.network.factory().remove_by_id(&self.collection, id);
        let count = response::parse_count(&self.network.send(spec, request).await?)?;
        if let Some(cache) = &self.cache {
            cache.remove(&Entity::with_id(id))?;
        }
        Ok(count)
    }

    /// Resolves the network leg of a local-then-network save.
    ///
    /// `settled` is the server copy recorded by whichever push transmitted
    /// the write, this one or a concurrent one.
    fn saved_entity(
        &self,
        report: PushReport,
        local: &Entity,
        settled: Option<Entity>,
    ) -> DataStoreResult<Entity> {
        if let Some(err) = report.errors.into_iter().next() {
            return Err(err);
        }
        if let Some(saved) = settled.or_else(|| report.saved.into_iter().next()) {
            return Ok(saved);
        }
        if report.attempted > 0 {
            return Err(DataStoreError::ObjectIdMissing);
        }
        let known = match (&self.cache, local.id()) {
            (Some(cache), Some(id)) if !is_temporary_id(id) => cache.find_by_id(id)?,
            _ => None,
        };
        known.ok_or_else(|| {
            DataStoreError::invalid_operation("the write is no longer pending")
        })
    }
}

/// Reads and writes one collection.
#[derive(Clone)]
pub struct DataStore {
    client: Arc<ClientInner>,
    collection: String,
    options: StoreOptions,
}

impl DataStore {
    pub(crate) fn new(client: Arc<ClientInner>, collection: String, options: StoreOptions) -> Self {
        Self {
            client,
            collection,
            options,
        }
    }

    /// Returns the collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the store options.
    pub fn options(&self) -> StoreOptions {
        self.options
    }

    /// Replaces the store options.
    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the collection's cache, if the client caches.
    pub fn cache(&self) -> Option<Arc<dyn Cache>> {
        self.client.cache(&self.collection)
    }

    fn writer(&self) -> Writer {
        Writer {
            network: Arc::clone(&self.client.network),
            collection: self.collection.clone(),
            cache: self.cache(),
            sync_queue: Arc::clone(&self.client.sync_queue),
        }
    }

    fn fetch_mode(&self, pull: bool) -> FetchMode {
        FetchMode {
            delta_set: self.options.delta_set,
            auto_pagination: self.options.auto_pagination,
            pull,
        }
    }

    /// Finds the records matching a query under the default read policy.
    pub fn find(&self, query: Query) -> OperationHandle<Vec<Entity>> {
        self.find_with_policy(query, self.options.read_policy)
    }

    /// Finds the records matching a query.
    pub fn find_with_policy(&self, query: Query, policy: ReadPolicy) -> OperationHandle<Vec<Entity>> {
        let cache = self.cache();
        let fetch = self.client.fetch_pipeline(&self.collection);
        let mode = self.fetch_mode(false);
        self.client
            .spawn("find", policy.result_count(), move |results, request| async move {
                dispatch_read(
                    policy,
                    &results,
                    || match &cache {
                        Some(cache) => cache.find(&query),
                        None => Ok(Vec::new()),
                    },
                    || fetch.fetch(&query, mode, &request),
                )
                .await;
            })
    }

    /// Finds one record under the default read policy.
    pub fn find_by_id(&self, id: impl Into<String>) -> OperationHandle<Option<Entity>> {
        self.find_by_id_with_policy(id, self.options.read_policy)
    }

    /// Finds one record.
    ///
    /// A record missing from the cache is an `EntityNotFound` error under
    /// `LocalOnly` and `Ok(None)` under the other policies.
    pub fn find_by_id_with_policy(
        &self,
        id: impl Into<String>,
        policy: ReadPolicy,
    ) -> OperationHandle<Option<Entity>> {
        let id = id.into();
        let cache = self.cache();
        let network = Arc::clone(&self.client.network);
        let collection = self.collection.clone();
        self.client
            .spawn("find_by_id", policy.result_count(), move |results, request| async move {
                let local = || -> DataStoreResult<Option<Entity>> {
                    let found = match &cache {
                        Some(cache) => cache.find_by_id(&id)?,
                        None => None,
                    };
                    if found.is_none() && policy == ReadPolicy::LocalOnly {
                        return Err(DataStoreError::entity_not_found(format!(
                            "{id} is not cached in {collection}"
                        )));
                    }
                    Ok(found)
                };
                let remote = || async {
                    let spec = network.factory().find_by_id(&collection, &id);
                    let entity = Entity::from_server_record(network.send_json(spec, &request).await?)?;
                    if let Some(cache) = &cache {
                        cache.save(entity.clone())?;
                    }
                    Ok::<_, DataStoreError>(Some(entity))
                };
                dispatch_read(policy, &results, local, remote).await;
            })
    }

    /// Counts the records matching a query's filter under the default policy.
    pub fn count(&self, query: Query) -> OperationHandle<usize> {
        self.count_with_policy(query, self.options.read_policy)
    }

    /// Counts the records matching a query's filter.
    ///
    /// Skip and limit are ignored on both legs.
    pub fn count_with_policy(&self, query: Query, policy: ReadPolicy) -> OperationHandle<usize> {
        let cache = self.cache();
        let fetch = self.client.fetch_pipeline(&self.collection);
        self.client
            .spawn("count", policy.result_count(), move |results, request| async move {
                dispatch_read(
                    policy,
                    &results,
                    || match &cache {
                        Some(cache) => cache.count(&query.scope()),
                        None => Ok(0),
                    },
                    || fetch.count(&query, &request),
                )
                .await;
            })
    }

    /// Saves a record under the default write policy.
    pub fn save(&self, entity: Entity) -> OperationHandle<Entity> {
        self.save_with_policy(entity, self.options.write_policy)
    }

    /// Saves a record.
    ///
    /// Records without an id get a temporary one for the local write; the
    /// server assigns the permanent id when the write is transmitted.
    pub fn save_with_policy(&self, entity: Entity, policy: WritePolicy) -> OperationHandle<Entity> {
        let writer = self.writer();
        let push = self.client.push_pipeline(&self.collection);
        self.client
            .spawn("save", policy.result_count(), move |results, request| async move {
                match policy {
                    WritePolicy::LocalOnly => {
                        results.send(writer.save_local(entity).map(|(saved, _)| saved));
                    }
                    WritePolicy::NetworkOnly => {
                        results.send(writer.save_remote(entity, &request).await);
                    }
                    WritePolicy::LocalThenNetwork => match writer.save_local(entity.clone()) {
                        Ok((local, operation)) => {
                            results.send(Ok(local.clone()));
                            let remote = push
                                .push(Some(std::slice::from_ref(&operation.id)), &request)
                                .await
                                .and_then(|report| {
                                    let settled = push.take_settled(operation.id);
                                    writer.saved_entity(report, &local, settled)
                                });
                            results.send(remote);
                        }
                        Err(err) => {
                            results.send(Err(err));
                            results.send(writer.save_remote(entity, &request).await);
                        }
                    },
                }
            })
    }

    /// Removes the records matching a query under the default write policy.
    pub fn remove(&self, query: Query) -> OperationHandle<u64> {
        self.remove_with_policy(query, self.options.write_policy)
    }

    /// Removes the records matching a query's filter; yields how many
    /// records were removed.
    ///
    /// Local removal only reaches cached records and queues a delete for
    /// each of them.
    pub fn remove_with_policy(&self, query: Query, policy: WritePolicy) -> OperationHandle<u64> {
        let writer = self.writer();
        let push = self.client.push_pipeline(&self.collection);
        self.client
            .spawn("remove", policy.result_count(), move |results, request| async move {
                match policy {
                    WritePolicy::NetworkOnly => {
                        results.send(writer.remove_remote(&query, &request).await);
                    }
                    WritePolicy::LocalOnly | WritePolicy::LocalThenNetwork => {
                        let local = writer.remove_local(&query);
                        if policy == WritePolicy::LocalOnly {
                            results.send(local.map(|(removed, _)| removed));
                            return;
                        }
                        match local {
                            Ok((removed, queued)) => {
                                results.send(Ok(removed));
                                results.send(push_removals(&push, &queued, &request).await);
                            }
                            Err(err) => {
                                results.send(Err(err));
                                results.send(writer.remove_remote(&query, &request).await);
                            }
                        }
                    }
                }
            })
    }

    /// Removes one record under the default write policy.
    pub fn remove_by_id(&self, id: impl Into<String>) -> OperationHandle<u64> {
        self.remove_by_id_with_policy(id, self.options.write_policy)
    }

    /// Removes one record; yields how many records were removed.
    pub fn remove_by_id_with_policy(
        &self,
        id: impl Into<String>,
        policy: WritePolicy,
    ) -> OperationHandle<u64> {
        let id = id.into();
        let writer = self.writer();
        let push = self.client.push_pipeline(&self.collection);
        self.client
            .spawn("remove_by_id", policy.result_count(), move |results, request| async move {
                match policy {
                    WritePolicy::NetworkOnly => {
                        results.send(writer.remove_by_id_remote(&id, &request).await);
                    }
                    WritePolicy::LocalOnly | WritePolicy::LocalThenNetwork => {
                        let local = writer.remove_by_id_local(&id);
                        if policy == WritePolicy::LocalOnly {
                            results.send(local.map(|(removed, _)| removed));
                            return;
                        }
                        match local {
                            Ok((removed, queued)) => {
                                results.send(Ok(removed));
                                results.send(push_removals(&push, &queued, &request).await);
                            }
                            Err(err) => {
                                results.send(Err(err));
                                results.send(writer.remove_by_id_remote(&id, &request).await);
                            }
                        }
                    }
                }
            })
    }

    /// Transmits every pending operation of the collection.
    pub fn push(&self) -> OperationHandle<PushResult> {
        let push = self.client.push_pipeline(&self.collection);
        self.client.spawn("push", 1, move |results, request| async move {
            results.send(push.push(None, &request).await.map(PushResult::from));
        })
    }

    /// Replaces the cached records in a query's scope with the server's.
    ///
    /// # Errors
    ///
    /// Yields `InvalidOperation` while the collection has pending
    /// operations: push them (or purge them) first.
    pub fn pull(&self, query: Query) -> OperationHandle<Vec<Entity>> {
        let sync_queue = Arc::clone(&self.client.sync_queue);
        let collection = self.collection.clone();
        let fetch = self.client.fetch_pipeline(&self.collection);
        let mode = self.fetch_mode(true);
        self.client.spawn("pull", 1, move |results, request| async move {
            let pulled = async {
                ensure_nothing_pending(sync_queue.as_ref(), &collection)?;
                fetch.fetch(&query, mode, &request).await
            };
            results.send(pulled.await);
        })
    }

    /// Pushes the pending operations, then pulls if the push succeeded.
    pub fn sync(&self, query: Query) -> OperationHandle<SyncResult> {
        let push = self.client.push_pipeline(&self.collection);
        let fetch = self.client.fetch_pipeline(&self.collection);
        let sync_queue = Arc::clone(&self.client.sync_queue);
        let collection = self.collection.clone();
        let mode = self.fetch_mode(true);
        self.client.spawn("sync", 1, move |results, request| async move {
            let synced = async {
                let report = push.push(None, &request).await?;
                let mut result = SyncResult {
                    pushed: report.count,
                    pulled: Vec::new(),
                    errors: report.errors,
                };
                if !result.errors.is_empty() {
                    tracing::info!(
                        collection = %collection,
                        errors = result.errors.len(),
                        "push failed, pull skipped"
                    );
                    return Ok(result);
                }
                let pulled = match ensure_nothing_pending(sync_queue.as_ref(), &collection) {
                    Ok(()) => fetch.fetch(&query, mode, &request).await,
                    Err(err) => Err(err),
                };
                match pulled {
                    Ok(entities) => result.pulled = entities,
                    Err(err) => result.errors.push(err),
                }
                Ok::<_, DataStoreError>(result)
            };
            results.send(synced.await);
        })
    }

    /// Discards every pending operation of the collection and restores the
    /// cache to the server's state for the affected records; yields the
    /// number of discarded operations.
    pub fn purge(&self) -> OperationHandle<usize> {
        let writer = self.writer();
        let fetch = self.client.fetch_pipeline(&self.collection);
        self.client.spawn("purge", 1, move |results, request| async move {
            let purged = async {
                let purged = writer.sync_queue.remove_all(&writer.collection)?;
                let mut refetch = Vec::new();
                for operation in &purged {
                    let Some(id) = operation.object_id.as_deref() else {
                        continue;
                    };
                    match (operation.method, &writer.cache) {
                        (PendingMethod::Create, Some(cache)) => {
                            cache.remove(&Entity::with_id(id))?;
                        }
                        (_, Some(_)) if !is_temporary_id(id) => refetch.push(id.to_string()),
                        _ => {}
                    }
                }

                if let (Some(cache), false) = (&writer.cache, refetch.is_empty()) {
                    let restored: HashSet<String> = fetch
                        .fetch_ids(&refetch, &request)
                        .await?
                        .iter()
                        .filter_map(|entity| entity.id().map(str::to_string))
                        .collect();
                    let gone: Vec<&String> =
                        refetch.iter().filter(|id| !restored.contains(*id)).collect();
                    if !gone.is_empty() {
                        cache.remove_by_query(&Query::ids_in(gone.into_iter().cloned()))?;
                    }
                }

                tracing::info!(
                    collection = %writer.collection,
                    purged = purged.len(),
                    restored = refetch.len(),
                    "purged pending operations"
                );
                Ok::<_, DataStoreError>(purged.len())
            };
            results.send(purged.await);
        })
    }

    /// Returns the number of pending operations of the collection.
    ///
    /// # Errors
    ///
    /// Returns the sync queue's error.
    pub fn sync_count(&self) -> DataStoreResult<usize> {
        self.client.sync_queue.count(&self.collection)
    }

    /// Empties the collection's cache.
    ///
    /// # Errors
    ///
    /// Returns the cache's error.
    pub fn clear_cache(&self) -> DataStoreResult<()> {
        match self.cache() {
            Some(cache) => cache.clear(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("collection", &self.collection)
            .field("options", &self.options)
            .finish()
    }
}

async fn push_removals(
    push: &crate::push::PushPipeline,
    queued: &[Uuid],
    request: &Arc<CompositeRequest>,
) -> DataStoreResult<u64> {
    if queued.is_empty() {
        return Ok(0);
    }
    let report = push.push(Some(queued), request).await?;
    match report.errors.into_iter().next() {
        Some(err) => Err(err),
        None => Ok(report.count),
    }
}

fn ensure_nothing_pending(sync_queue: &dyn SyncQueue, collection: &str) -> DataStoreResult<()> {
    let pending = sync_queue.count(collection)?;
    if pending > 0 {
        return Err(DataStoreError::invalid_operation(format!(
            "{collection} has {pending} pending operations; push or purge them before pulling"
        )));
    }
    Ok(())
}

/// A [`DataStore`] that converts records to and from a [`Persistable`] type.
pub struct TypedStore<T> {
    store: DataStore,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Persistable> TypedStore<T> {
    pub(crate) fn new(store: DataStore) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    /// Returns the untyped store.
    pub fn store(&self) -> &DataStore {
        &self.store
    }

    /// Replaces the store options.
    pub fn with_options(self, options: StoreOptions) -> Self {
        Self::new(self.store.with_options(options))
    }

    /// Finds the values matching a query under the default read policy.
    pub fn find(&self, query: Query) -> OperationHandle<Vec<T>> {
        self.store.find(query).map(from_entities::<T>)
    }

    /// Finds the values matching a query.
    pub fn find_with_policy(&self, query: Query, policy: ReadPolicy) -> OperationHandle<Vec<T>> {
        self.store
            .find_with_policy(query, policy)
            .map(from_entities::<T>)
    }

    /// Finds one value under the default read policy.
    pub fn find_by_id(&self, id: impl Into<String>) -> OperationHandle<Option<T>> {
        self.store
            .find_by_id(id)
            .map(|found| found.map(T::from_entity).transpose())
    }

    /// Finds one value.
    pub fn find_by_id_with_policy(
        &self,
        id: impl Into<String>,
        policy: ReadPolicy,
    ) -> OperationHandle<Option<T>> {
        self.store
            .find_by_id_with_policy(id, policy)
            .map(|found| found.map(T::from_entity).transpose())
    }

    /// Counts the values matching a query's filter.
    pub fn count(&self, query: Query) -> OperationHandle<usize> {
        self.store.count(query)
    }

    /// Saves a value under the default write policy.
    pub fn save(&self, value: &T) -> OperationHandle<T> {
        self.save_with_policy(value, self.store.options.write_policy)
    }

    /// Saves a value.
    pub fn save_with_policy(&self, value: &T, policy: WritePolicy) -> OperationHandle<T> {
        match value.to_entity() {
            Ok(entity) => self
                .store
                .save_with_policy(entity, policy)
                .map(T::from_entity),
            Err(err) => OperationHandle::ready(Err(err)),
        }
    }

    /// Removes one value by id.
    pub fn remove_by_id(&self, id: impl Into<String>) -> OperationHandle<u64> {
        self.store.remove_by_id(id)
    }

    /// Removes the values matching a query's filter.
    pub fn remove(&self, query: Query) -> OperationHandle<u64> {
        self.store.remove(query)
    }

    /// Transmits every pending operation of the collection.
    pub fn push(&self) -> OperationHandle<PushResult> {
        self.store.push()
    }

    /// Replaces the cached values in a query's scope with the server's.
    pub fn pull(&self, query: Query) -> OperationHandle<Vec<T>> {
        self.store.pull(query).map(from_entities::<T>)
    }

    /// Returns the number of pending operations of the collection.
    ///
    /// # Errors
    ///
    /// Returns the sync queue's error.
    pub fn sync_count(&self) -> DataStoreResult<usize> {
        self.store.sync_count()
    }
}

impl<T> Clone for TypedStore<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for TypedStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedStore").field("store", &self.store).finish()
    }
}

fn from_entities<T: Persistable>(entities: Vec<Entity>) -> DataStoreResult<Vec<T>> {
    entities.into_iter().map(T::from_entity).collect()
}
