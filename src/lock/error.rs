use serde::{Deserialize, Serialize};

/// Concrete type for a [`crate::lock::Lock`] error
pub type Result<T> = std::result::Result<T, Error>;

/// Enum that represents a [`crate::lock::Lock`] or [`crate::lock::LockService`] error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// The lock service connection is down (or was closed) and the operation can't be retried
    NotConnected { addr: String },
    /// Returned by `release` when the caller's session doesn't hold the lock (eg: the session expired)
    NotHeld { path: String },
    /// Generic IO error (automatically converted from [`std::io::Error`])
    Io { reason: String },
    /// Variant returned if the client was unable to interpret the server response
    InvalidServerResponse { reason: String },
    /// The lock server rejected the request
    Server { reason: String },
    /// Error returned by fault injection
    Injected { reason: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io {
            reason: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidServerResponse {
            reason: value.to_string(),
        }
    }
}

impl From<crate::error::Error> for Error {
    fn from(value: crate::error::Error) -> Self {
        use crate::error::Error as TopLevelError;
        match value {
            TopLevelError::Lock(err) => err,
            TopLevelError::Io { reason } => Error::Io { reason },
            _ => Self::Server {
                reason: value.to_string(),
            },
        }
    }
}
