//! Executes request specs as cancellable, time-limited tasks.

use crate::factory::RequestFactory;
use crate::request::{CompositeRequest, Request, TaskRequest};
use crate::response;
use crate::transport::{HttpResponse, Transport};
use offsync_core::{DataStoreError, DataStoreResult, RequestSpec};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Sends requests on behalf of every pipeline of a client.
pub struct Network {
    transport: Arc<dyn Transport>,
    factory: RequestFactory,
    timeout: Duration,
}

impl Network {
    /// Creates a network executor.
    pub fn new(transport: Arc<dyn Transport>, factory: RequestFactory, timeout: Duration) -> Self {
        Self {
            transport,
            factory,
            timeout,
        }
    }

    /// Returns the request factory.
    pub fn factory(&self) -> &RequestFactory {
        &self.factory
    }

    /// Sends a request as a task registered on `parent`.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `parent` is or gets cancelled, `Timeout` if
    /// the call exceeds the configured timeout, and any transport failure.
    pub async fn send(
        &self,
        spec: RequestSpec,
        parent: &CompositeRequest,
    ) -> DataStoreResult<HttpResponse> {
        let request = TaskRequest::new(spec.to_string());
        parent.add(Arc::clone(&request) as Arc<dyn Request>);
        if request.is_cancelled() {
            return Err(DataStoreError::Cancelled);
        }

        tracing::trace!(request = %request.label(), "sending request");

        let transport = Arc::clone(&self.transport);
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(timeout, transport.execute(&spec)).await {
                Ok(result) => result,
                Err(_) => Err(DataStoreError::Timeout),
            }
        });
        request.attach(handle.abort_handle());

        let result = match handle.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(DataStoreError::Cancelled),
            Err(err) => Err(DataStoreError::Transport(format!(
                "request task failed: {err}"
            ))),
        };
        request.finish();

        if let Err(err) = &result {
            tracing::debug!(request = %request.label(), error = %err, "request failed");
        }
        result
    }

    /// Sends a request and parses the JSON body.
    ///
    /// # Errors
    ///
    /// Same as [`Network::send`], plus the classified error of a non-2xx
    /// response.
    pub async fn send_json(
        &self,
        spec: RequestSpec,
        parent: &CompositeRequest,
    ) -> DataStoreResult<Value> {
        response::parse_json(&self.send(spec, parent).await?)
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("factory", &self.factory)
            .field("timeout", &self.timeout)
            .finish()
    }
}
