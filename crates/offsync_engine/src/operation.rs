//! Operation handles and read-policy dispatch.

use crate::request::{CompositeRequest, Request};
use offsync_core::{DataStoreError, DataStoreResult, ReadPolicy};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The pending result(s) of a data store operation.
///
/// Local-then-network operations deliver two results, every other policy
/// delivers one. Dropping the handle does not cancel the operation; call
/// [`OperationHandle::cancel`] for that.
pub struct OperationHandle<T> {
    request: Arc<CompositeRequest>,
    results: mpsc::UnboundedReceiver<DataStoreResult<T>>,
    expected: usize,
}

impl<T> OperationHandle<T> {
    pub(crate) fn new(
        request: Arc<CompositeRequest>,
        results: mpsc::UnboundedReceiver<DataStoreResult<T>>,
        expected: usize,
    ) -> Self {
        Self {
            request,
            results,
            expected,
        }
    }

    /// Creates a handle whose single result is already known.
    pub(crate) fn ready(result: DataStoreResult<T>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(result);
        Self::new(CompositeRequest::new(), receiver, 1)
    }

    /// Number of results the operation delivers when it runs to completion.
    pub fn expected_results(&self) -> usize {
        self.expected
    }

    /// Waits for the next result; `None` once the operation is over.
    pub async fn next(&mut self) -> Option<DataStoreResult<T>> {
        self.results.recv().await
    }

    /// Waits for every result.
    pub async fn collect(mut self) -> Vec<DataStoreResult<T>> {
        let mut results = Vec::with_capacity(self.expected);
        while let Some(result) = self.results.recv().await {
            results.push(result);
        }
        results
    }

    /// Waits for the final result.
    ///
    /// # Errors
    ///
    /// Returns the final result's error, or `Cancelled` if the operation
    /// ended without delivering any result.
    pub async fn last(self) -> DataStoreResult<T> {
        self.collect()
            .await
            .pop()
            .unwrap_or(Err(DataStoreError::Cancelled))
    }

    /// Cancels every request of the operation.
    pub fn cancel(&self) {
        self.request.cancel();
    }

    /// Returns true while a network request of the operation is in flight.
    pub fn is_executing(&self) -> bool {
        self.request.is_executing()
    }

    /// Returns true once the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.request.is_cancelled()
    }

    /// Returns the composite request of the operation.
    pub fn request(&self) -> &Arc<CompositeRequest> {
        &self.request
    }
}

impl<T: Send + 'static> OperationHandle<T> {
    /// Converts every result with `f`.
    pub fn map<U, F>(self, f: F) -> OperationHandle<U>
    where
        U: Send + 'static,
        F: Fn(T) -> DataStoreResult<U> + Send + 'static,
    {
        let OperationHandle {
            request,
            mut results,
            expected,
        } = self;
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(result) = results.recv().await {
                if sender.send(result.and_then(&f)).is_err() {
                    break;
                }
            }
        });
        OperationHandle::new(request, receiver, expected)
    }
}

impl<T> std::fmt::Debug for OperationHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("request", &self.request)
            .field("expected", &self.expected)
            .finish()
    }
}

/// Delivers results to an [`OperationHandle`].
pub(crate) struct ResultSender<T> {
    sender: mpsc::UnboundedSender<DataStoreResult<T>>,
}

impl<T> ResultSender<T> {
    pub fn new(sender: mpsc::UnboundedSender<DataStoreResult<T>>) -> Self {
        Self { sender }
    }

    /// Delivers a result; a dropped handle is not an error.
    pub fn send(&self, result: DataStoreResult<T>) {
        let _ = self.sender.send(result);
    }
}

/// Runs the local and network legs of a read under a policy.
///
/// The local leg reports absence however the caller chooses; the network
/// leg's failure under `NetworkOtherwiseLocal` falls back to the local leg
/// unless the operation was cancelled.
pub(crate) async fn dispatch_read<T, L, N, Fut>(
    policy: ReadPolicy,
    results: &ResultSender<T>,
    local: L,
    network: N,
) where
    L: FnOnce() -> DataStoreResult<T>,
    N: FnOnce() -> Fut,
    Fut: Future<Output = DataStoreResult<T>>,
{
    match policy {
        ReadPolicy::LocalOnly => results.send(local()),
        ReadPolicy::NetworkOnly => results.send(network().await),
        ReadPolicy::LocalThenNetwork => {
            results.send(local());
            results.send(network().await);
        }
        ReadPolicy::NetworkOtherwiseLocal => match network().await {
            Ok(value) => results.send(Ok(value)),
            Err(err) if err.is_cancelled() => results.send(Err(err)),
            Err(err) => {
                tracing::debug!(error = %err, "network read failed, falling back to the cache");
                results.send(local());
            }
        },
    }
}
