//! Error types for Mooring core.

use mooring_codec::CodecError;
use mooring_storage::StorageError;
use std::sync::Arc;
use thiserror::Error;

/// Result type for core operations.
pub type MooringResult<T> = Result<T, MooringError>;

/// Numeric error codes shared with the REST backend.
pub mod codes {
    /// Generic failure with no specific code.
    pub const OTHER_CAUSE: i32 = -1;
    /// The backend could not be reached.
    pub const CONNECTION_FAILED: i32 = 100;
    /// The object does not exist (or is not visible).
    pub const OBJECT_NOT_FOUND: i32 = 101;
    /// The query is malformed or cannot be evaluated.
    pub const INVALID_QUERY: i32 = 102;
    /// A field or sort key name is invalid.
    pub const INVALID_KEY_NAME: i32 = 105;
    /// A field holds a value of the wrong type.
    pub const INCORRECT_TYPE: i32 = 111;
    /// A cache-only query found nothing cached.
    pub const CACHE_MISS: i32 = 120;
}

/// Coarse classification of a [`MooringError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or semantically impossible query.
    InvalidQuery,
    /// The caller passed a disallowed value or shape.
    IllegalArgument,
    /// The operation is not allowed in the object's current state.
    IllegalState,
    /// Local lookup miss.
    NotFound,
    /// Transient network failure; eligible for retry by the command layer.
    ConnectionFailed,
    /// Disk read or write failure.
    PersistFailed,
    /// Cooperative cancellation.
    Cancelled,
    /// Error reported by the backend with a numeric code.
    Server,
    /// Encoding or decoding failure.
    Codec,
}

/// Errors that can occur in Mooring operations.
///
/// Errors are cheap to clone so that a single failure can be handed to every
/// waiter of a shared in-flight operation.
#[derive(Debug, Clone, Error)]
pub enum MooringError {
    /// Byte store failure.
    #[error("storage error: {0}")]
    Storage(#[source] Arc<StorageError>),

    /// Value codec failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The query cannot be evaluated.
    #[error("invalid query: {message}")]
    InvalidQuery {
        /// Description of the problem.
        message: String,
    },

    /// A disallowed argument.
    #[error("illegal argument: {message}")]
    IllegalArgument {
        /// Description of the problem.
        message: String,
    },

    /// An operation not allowed in the current state.
    #[error("illegal state: {message}")]
    IllegalState {
        /// Description of the problem.
        message: String,
    },

    /// A local lookup found nothing.
    #[error("not found: {message}")]
    NotFound {
        /// What was looked up.
        message: String,
    },

    /// The backend could not be reached.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Local persistence failed.
    #[error("persist failed: {message}")]
    PersistFailed {
        /// Description of the failure.
        message: String,
    },

    /// The operation was cancelled before completing.
    #[error("operation cancelled")]
    Cancelled,

    /// The backend rejected the request.
    #[error("server error {code}: {message}")]
    Server {
        /// Backend error code.
        code: i32,
        /// Backend error message.
        message: String,
    },
}

impl From<StorageError> for MooringError {
    fn from(error: StorageError) -> Self {
        Self::Storage(Arc::new(error))
    }
}

impl MooringError {
    /// Creates an invalid query error.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            message: message.into(),
        }
    }

    /// Creates an illegal argument error.
    pub fn illegal_argument(message: impl Into<String>) -> Self {
        Self::IllegalArgument {
            message: message.into(),
        }
    }

    /// Creates an illegal state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    /// Creates a persist failed error.
    pub fn persist_failed(message: impl Into<String>) -> Self {
        Self::PersistFailed {
            message: message.into(),
        }
    }

    /// Maps a backend error code and message onto the taxonomy.
    pub fn from_server(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            codes::CONNECTION_FAILED => Self::ConnectionFailed { message },
            codes::OBJECT_NOT_FOUND => Self::NotFound { message },
            codes::INVALID_QUERY => Self::InvalidQuery { message },
            _ => Self::Server { code, message },
        }
    }

    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(_) | Self::PersistFailed { .. } => ErrorKind::PersistFailed,
            Self::Codec(CodecError::OutOfRange { .. }) => ErrorKind::IllegalArgument,
            Self::Codec(_) => ErrorKind::Codec,
            Self::InvalidQuery { .. } => ErrorKind::InvalidQuery,
            Self::IllegalArgument { .. } => ErrorKind::IllegalArgument,
            Self::IllegalState { .. } => ErrorKind::IllegalState,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Server { .. } => ErrorKind::Server,
        }
    }

    /// Returns the numeric code the backend would use for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => codes::CONNECTION_FAILED,
            Self::NotFound { .. } => codes::OBJECT_NOT_FOUND,
            Self::InvalidQuery { .. } => codes::INVALID_QUERY,
            Self::Server { code, .. } => *code,
            _ => codes::OTHER_CAUSE,
        }
    }

    /// Returns whether retrying the same command later may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::ConnectionFailed
    }
}
