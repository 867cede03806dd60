//! Error types shared by every offsync crate.

use thiserror::Error;

/// Result type for data store operations.
pub type DataStoreResult<T> = Result<T, DataStoreError>;

/// Why the server refused to authorize a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// The credentials are valid but not enough to complete the request.
    ///
    /// Queued writes failing with this reason can never succeed as queued.
    InsufficientCredentials,
    /// The credentials are not valid (expired, revoked, malformed).
    InvalidCredentials,
    /// Any other authorization failure reported by the server.
    Other(String),
}

impl AuthFailure {
    /// Wire constant for 401 responses with insufficient credentials.
    pub const INSUFFICIENT_CREDENTIALS: &'static str = "InsufficientCredentials";
    /// Wire constant for 401 responses with invalid credentials.
    pub const INVALID_CREDENTIALS: &'static str = "InvalidCredentials";

    /// Classifies the `error` field of a 401 response body.
    pub fn from_code(code: &str) -> Self {
        match code {
            Self::INSUFFICIENT_CREDENTIALS => AuthFailure::InsufficientCredentials,
            Self::INVALID_CREDENTIALS => AuthFailure::InvalidCredentials,
            other => AuthFailure::Other(other.to_string()),
        }
    }

    /// Returns the wire code for this failure.
    pub fn code(&self) -> &str {
        match self {
            AuthFailure::InsufficientCredentials => Self::INSUFFICIENT_CREDENTIALS,
            AuthFailure::InvalidCredentials => Self::INVALID_CREDENTIALS,
            AuthFailure::Other(code) => code,
        }
    }
}

/// Errors that can occur while reading or writing collection records.
#[derive(Error, Debug, Clone)]
pub enum DataStoreError {
    /// The server rejected the credentials used for the request.
    #[error("unauthorized ({}): {description}", reason.code())]
    Unauthorized {
        /// Sub-reason of the failure.
        reason: AuthFailure,
        /// Debug message from the server.
        debug: String,
        /// Human readable description.
        description: String,
    },

    /// The requested entity does not exist.
    #[error("entity not found: {description}")]
    EntityNotFound {
        /// Human readable description.
        description: String,
    },

    /// A data link endpoint could not find the entity.
    #[error("data link entity not found: {description}")]
    DataLinkEntityNotFound {
        /// Debug message from the server.
        debug: String,
        /// Human readable description.
        description: String,
    },

    /// The method is not allowed for this collection.
    #[error("method not allowed: {description}")]
    MethodNotAllowed {
        /// Debug message from the server.
        debug: String,
        /// Human readable description.
        description: String,
    },

    /// The backend is missing a required configuration.
    #[error("missing configuration: {description}")]
    MissingConfiguration {
        /// Debug message from the server.
        debug: String,
        /// Human readable description.
        description: String,
    },

    /// The application key does not match any environment.
    #[error("app not found: {description}")]
    AppNotFound {
        /// Human readable description.
        description: String,
    },

    /// The server forbids the request.
    #[error("forbidden: {description}")]
    Forbidden {
        /// Human readable description.
        description: String,
    },

    /// The query matched more records than the server will return at once.
    #[error("result set size exceeded: {description}")]
    ResultSetSizeExceeded {
        /// Debug message from the server.
        debug: String,
        /// Human readable description.
        description: String,
    },

    /// A server record arrived without an `_id`.
    #[error("object id missing")]
    ObjectIdMissing,

    /// The response body could not be parsed or had an unexpected shape.
    #[error("invalid response (status {status}): {message}")]
    InvalidResponse {
        /// HTTP status code.
        status: u16,
        /// What was wrong with the body.
        message: String,
    },

    /// A well-formed error body that is not recognized.
    #[error("unknown server error (status {status}): {body}")]
    UnknownServerError {
        /// HTTP status code.
        status: u16,
        /// Raw JSON error body.
        body: String,
    },

    /// The request was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The transport failed before a response was received.
    #[error("transport error: {0}")]
    Transport(String),

    /// The operation is not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The durable sync queue could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// An entity could not be converted to or from JSON.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DataStoreError {
    /// Creates an unauthorized error.
    pub fn unauthorized(
        reason: AuthFailure,
        debug: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self::Unauthorized {
            reason,
            debug: debug.into(),
            description: description.into(),
        }
    }

    /// Creates an invalid response error.
    pub fn invalid_response(status: u16, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            status,
            message: message.into(),
        }
    }

    /// Creates an entity not found error.
    pub fn entity_not_found(description: impl Into<String>) -> Self {
        Self::EntityNotFound {
            description: description.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    /// Returns true if the server reported insufficient (not stale) credentials.
    pub fn is_insufficient_credentials(&self) -> bool {
        matches!(
            self,
            DataStoreError::Unauthorized {
                reason: AuthFailure::InsufficientCredentials,
                ..
            }
        )
    }

    /// Returns true if this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DataStoreError::Cancelled)
    }

    /// Returns true if the same request may succeed when repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DataStoreError::Timeout
                | DataStoreError::Transport(_)
                | DataStoreError::UnknownServerError { .. }
                | DataStoreError::InvalidResponse { .. }
        )
    }
}

impl From<serde_json::Error> for DataStoreError {
    fn from(err: serde_json::Error) -> Self {
        DataStoreError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for DataStoreError {
    fn from(err: std::io::Error) -> Self {
        DataStoreError::Storage(err.to_string())
    }
}
