//! Cancellable units of work.
//!
//! Every network call and every push transmission runs as its own tokio
//! task, wrapped in a [`TaskRequest`]. An operation groups its tasks in a
//! [`CompositeRequest`]; cancelling the composite aborts every task that is
//! registered now or later.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::task::AbortHandle;

/// A unit of work that can be observed and cancelled.
pub trait Request: Send + Sync {
    /// Returns true while the work is in flight.
    fn is_executing(&self) -> bool;

    /// Returns true once the work was cancelled.
    fn is_cancelled(&self) -> bool;

    /// Cancels the work. Cancelling twice is a no-op.
    fn cancel(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Executing,
    Finished,
    Cancelled,
}

struct TaskState {
    phase: Phase,
    abort: Option<AbortHandle>,
}

/// A request backed by a spawned tokio task.
pub struct TaskRequest {
    label: String,
    state: Mutex<TaskState>,
}

impl TaskRequest {
    /// Creates a request that has not started yet.
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            state: Mutex::new(TaskState {
                phase: Phase::Pending,
                abort: None,
            }),
        })
    }

    /// Returns the label given at creation.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Binds the request to its task.
    ///
    /// If the request was cancelled before the task was spawned, the task
    /// is aborted right away.
    pub fn attach(&self, abort: AbortHandle) {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Cancelled => abort.abort(),
            Phase::Pending => {
                state.phase = Phase::Executing;
                state.abort = Some(abort);
            }
            Phase::Executing | Phase::Finished => {}
        }
    }

    /// Marks the task as completed.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        if state.phase != Phase::Cancelled {
            state.phase = Phase::Finished;
        }
        state.abort = None;
    }
}

impl Request for TaskRequest {
    fn is_executing(&self) -> bool {
        self.state.lock().phase == Phase::Executing
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().phase == Phase::Cancelled
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Finished {
            return;
        }
        state.phase = Phase::Cancelled;
        if let Some(abort) = state.abort.take() {
            abort.abort();
        }
    }
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("label", &self.label)
            .field("phase", &self.state.lock().phase)
            .finish()
    }
}

struct CompositeState {
    requests: Vec<Arc<dyn Request>>,
    cancelled: bool,
}

/// A group of sub-requests that is cancelled as a whole.
///
/// Cancellation is sticky: a sub-request added after [`Request::cancel`]
/// is cancelled immediately.
pub struct CompositeRequest {
    state: Mutex<CompositeState>,
}

impl CompositeRequest {
    /// Creates an empty composite.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CompositeState {
                requests: Vec::new(),
                cancelled: false,
            }),
        })
    }

    /// Adds a sub-request.
    pub fn add(&self, request: Arc<dyn Request>) {
        let mut state = self.state.lock();
        if state.cancelled {
            drop(state);
            request.cancel();
            return;
        }
        state.requests.push(request);
    }

    /// Creates a nested composite registered as a sub-request.
    ///
    /// Cancelling the child leaves the parent running; cancelling the
    /// parent cancels the child.
    pub fn child(&self) -> Arc<CompositeRequest> {
        let child = CompositeRequest::new();
        self.add(Arc::clone(&child) as Arc<dyn Request>);
        child
    }

    /// Returns the number of registered sub-requests.
    pub fn len(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Returns true if no sub-request was registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Request for CompositeRequest {
    fn is_executing(&self) -> bool {
        let requests = self.state.lock().requests.clone();
        requests.iter().any(|request| request.is_executing())
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    fn cancel(&self) {
        let requests = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.requests)
        };
        tracing::debug!(sub_requests = requests.len(), "cancelling composite request");
        for request in requests {
            request.cancel();
        }
    }
}

impl fmt::Debug for CompositeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CompositeRequest")
            .field("requests", &state.requests.len())
            .field("cancelled", &state.cancelled)
            .finish()
    }
}
