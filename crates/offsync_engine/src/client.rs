//! The client context shared by every data store.

use crate::config::ClientConfig;
use crate::factory::RequestFactory;
use crate::fetch::FetchPipeline;
use crate::network::Network;
use crate::operation::{OperationHandle, ResultSender};
use crate::push::{PushPipeline, PushSequencer};
use crate::request::{CompositeRequest, Request, TaskRequest};
use crate::store::{DataStore, TypedStore};
use crate::transport::Transport;
use offsync_core::{
    Cache, CacheManager, DataStoreError, DataStoreResult, MemoryCacheManager, MemorySyncQueue,
    Persistable, SyncQueue,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Semaphore};

/// Shared state of a client.
pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) network: Arc<Network>,
    pub(crate) cache_manager: Option<Arc<dyn CacheManager>>,
    pub(crate) sync_queue: Arc<dyn SyncQueue>,
    sequencer: Arc<PushSequencer>,
    workers: Arc<Semaphore>,
    operations: Mutex<Vec<Weak<CompositeRequest>>>,
    closed: AtomicBool,
}

impl ClientInner {
    pub(crate) fn cache(&self, collection: &str) -> Option<Arc<dyn Cache>> {
        self.cache_manager
            .as_ref()
            .map(|manager| manager.cache(collection))
    }

    pub(crate) fn fetch_pipeline(&self, collection: &str) -> FetchPipeline {
        FetchPipeline::new(
            Arc::clone(&self.network),
            collection,
            self.cache(collection),
            self.config.page_size,
            self.config.max_ids_per_query,
        )
    }

    pub(crate) fn push_pipeline(&self, collection: &str) -> PushPipeline {
        PushPipeline::new(
            Arc::clone(&self.network),
            collection,
            self.cache(collection),
            Arc::clone(&self.sync_queue),
            Arc::clone(&self.sequencer),
            Arc::clone(&self.workers),
        )
    }

    /// Runs an operation as a task and returns its handle.
    ///
    /// Must be called within a tokio runtime.
    pub(crate) fn spawn<T, F, Fut>(&self, label: &str, expected: usize, operation: F) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(ResultSender<T>, Arc<CompositeRequest>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let request = CompositeRequest::new();
        let (sender, receiver) = mpsc::unbounded_channel();
        let results = ResultSender::new(sender);
        let handle = OperationHandle::new(Arc::clone(&request), receiver, expected);

        if self.closed.load(Ordering::SeqCst) {
            results.send(Err(DataStoreError::invalid_operation("client is shut down")));
            return handle;
        }
        self.track(&request);

        let driver = TaskRequest::new(label);
        request.add(Arc::clone(&driver) as Arc<dyn Request>);
        let future = operation(results, Arc::clone(&request));
        let finished = Arc::clone(&driver);
        let task = tokio::spawn(async move {
            future.await;
            finished.finish();
        });
        driver.attach(task.abort_handle());
        tracing::trace!(operation = label, "operation started");
        handle
    }

    fn track(&self, request: &Arc<CompositeRequest>) {
        let mut operations = self.operations.lock();
        operations.retain(|weak| weak.strong_count() > 0);
        operations.push(Arc::downgrade(request));
    }
}

/// Entry point: the explicit context every data store is bound to.
///
/// Clones share the same context.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Starts building a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Returns the sync queue.
    pub fn sync_queue(&self) -> &Arc<dyn SyncQueue> {
        &self.inner.sync_queue
    }

    /// Returns the cache of a collection, if the client caches.
    pub fn cache(&self, collection: &str) -> Option<Arc<dyn Cache>> {
        self.inner.cache(collection)
    }

    /// Returns a data store for a collection, using the configured defaults.
    pub fn collection(&self, name: impl Into<String>) -> DataStore {
        DataStore::new(Arc::clone(&self.inner), name.into(), self.inner.config.store)
    }

    /// Returns a typed store for a [`Persistable`] type.
    pub fn typed<T: Persistable>(&self) -> TypedStore<T> {
        TypedStore::new(self.collection(T::COLLECTION))
    }

    /// Empties every cache of the client.
    ///
    /// # Errors
    ///
    /// Returns the cache manager's error.
    pub fn clear_caches(&self) -> DataStoreResult<()> {
        match &self.inner.cache_manager {
            Some(manager) => manager.clear_all(),
            None => Ok(()),
        }
    }

    /// Cancels every outstanding operation and rejects new ones.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let operations = std::mem::take(&mut *self.inner.operations.lock());
        let mut cancelled = 0usize;
        for request in operations.iter().filter_map(Weak::upgrade) {
            request.cancel();
            cancelled += 1;
        }
        self.inner.workers.close();
        tracing::info!(cancelled, "client shut down");
    }

    /// Returns true after [`Client::shutdown`].
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("caching", &self.inner.cache_manager.is_some())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Builds a [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    config: Option<ClientConfig>,
    transport: Option<Arc<dyn Transport>>,
    cache_manager: Option<Arc<dyn CacheManager>>,
    without_cache: bool,
    sync_queue: Option<Arc<dyn SyncQueue>>,
}

impl ClientBuilder {
    /// Sets the configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the transport. Required.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the cache manager. Defaults to in-memory caches.
    pub fn cache_manager(mut self, manager: Arc<dyn CacheManager>) -> Self {
        self.cache_manager = Some(manager);
        self.without_cache = false;
        self
    }

    /// Builds a client without any cache: every read and write goes to the
    /// network.
    pub fn without_cache(mut self) -> Self {
        self.cache_manager = None;
        self.without_cache = true;
        self
    }

    /// Sets the sync queue. Defaults to an in-memory queue.
    pub fn sync_queue(mut self, queue: Arc<dyn SyncQueue>) -> Self {
        self.sync_queue = Some(queue);
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if no transport or no app key was given.
    pub fn build(self) -> DataStoreResult<Client> {
        let config = self
            .config
            .ok_or_else(|| DataStoreError::invalid_operation("a client configuration is required"))?;
        if config.app_key.is_empty() {
            return Err(DataStoreError::invalid_operation("an app key is required"));
        }
        let transport = self
            .transport
            .ok_or_else(|| DataStoreError::invalid_operation("a transport is required"))?;

        let cache_manager = match (self.cache_manager, self.without_cache) {
            (Some(manager), _) => Some(manager),
            (None, true) => None,
            (None, false) => Some(Arc::new(MemoryCacheManager::new()) as Arc<dyn CacheManager>),
        };
        let sync_queue = self
            .sync_queue
            .unwrap_or_else(|| Arc::new(MemorySyncQueue::new()) as Arc<dyn SyncQueue>);

        let network = Arc::new(Network::new(
            transport,
            RequestFactory::new(config.app_key.clone()),
            config.request_timeout,
        ));
        let workers = Arc::new(Semaphore::new(config.push_concurrency.max(1)));

        tracing::debug!(
            app_key = %config.app_key,
            api_host = %config.api_host,
            caching = cache_manager.is_some(),
            "client created"
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                config,
                network,
                cache_manager,
                sync_queue,
                sequencer: Arc::new(PushSequencer::default()),
                workers,
                operations: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }
}
