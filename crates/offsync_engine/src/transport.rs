//! Transport layer abstraction.
//!
//! The engine never talks HTTP itself: it hands a [`RequestSpec`] to a
//! [`Transport`] and classifies the [`HttpResponse`] that comes back.
//! Cancelling an in-flight call drops the transport future, so
//! implementations must release their resources on drop.

use async_trait::async_trait;
use offsync_core::{DataStoreError, DataStoreResult, RequestSpec};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A raw response: status code and body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Creates a response with a JSON body.
    pub fn json(status: u16, body: &Value) -> Self {
        Self::new(status, body.to_string())
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends requests to the backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Executes a request.
    ///
    /// Errors are reserved for failures before a response arrived (no
    /// connection, TLS failure). Error statuses are returned as responses.
    async fn execute(&self, request: &RequestSpec) -> DataStoreResult<HttpResponse>;
}

/// A scripted transport for testing.
///
/// Responses are consumed in order; once the script is exhausted the
/// default response (if any) is returned for every call.
#[derive(Debug, Default)]
pub struct MockTransport {
    disconnected: AtomicBool,
    script: Mutex<VecDeque<DataStoreResult<HttpResponse>>>,
    default_response: Mutex<Option<HttpResponse>>,
    delay: Mutex<Duration>,
    requests: Mutex<Vec<RequestSpec>>,
}

impl MockTransport {
    /// Creates a mock transport with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a response to the script.
    pub fn push_response(&self, response: HttpResponse) {
        self.script.lock().push_back(Ok(response));
    }

    /// Appends a JSON response to the script.
    pub fn push_json(&self, status: u16, body: Value) {
        self.push_response(HttpResponse::json(status, &body));
    }

    /// Appends a transport failure to the script.
    pub fn push_error(&self, error: DataStoreError) {
        self.script.lock().push_back(Err(error));
    }

    /// Sets the response returned once the script is exhausted.
    pub fn set_default_response(&self, response: HttpResponse) {
        *self.default_response.lock() = Some(response);
    }

    /// Delays every call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Sets the connected state; a disconnected mock fails every call.
    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<RequestSpec> {
        self.requests.lock().clone()
    }

    /// Returns the number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: &RequestSpec) -> DataStoreResult<HttpResponse> {
        self.requests.lock().push(request.clone());

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.disconnected.load(Ordering::SeqCst) {
            return Err(DataStoreError::Transport("not connected".into()));
        }

        if let Some(scripted) = self.script.lock().pop_front() {
            return scripted;
        }
        self.default_response
            .lock()
            .clone()
            .ok_or_else(|| DataStoreError::Transport(format!("no mock response for {request}")))
    }
}
