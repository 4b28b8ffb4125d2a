//! Error types for the ofc controller
//!
//! The variants follow the failure taxonomy of the control channel: connect
//! failures are fatal to `start()`, I/O failures break the session, protocol
//! failures drop a single message, capacity and consistency failures are
//! reported at the call site.

use thiserror::Error;

/// Main error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connect error: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Flow table '{table}' is full (max {max} entries)")]
    Capacity { table: String, max: usize },

    #[error("Flow state inconsistency for cookie {cookie:#x}: {detail}")]
    Consistency { cookie: u64, detail: String },

    #[error("Switch session is disconnected")]
    Disconnected,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a connect error
    pub fn connect(msg: impl Into<String>) -> Self {
        Error::Connect(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a consistency error
    pub fn consistency(cookie: u64, detail: impl Into<String>) -> Self {
        Error::Consistency {
            cookie,
            detail: detail.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Returns true if this error means the switch session can no longer be used
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Disconnected | Error::Connect(_))
    }

    /// Returns true if the caller may carry on after logging this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::Capacity { .. }
                | Error::Consistency { .. }
                | Error::Timeout(_)
                | Error::NotFound(_)
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}
