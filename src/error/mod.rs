//! This module defines caller visible errors that can be returned by partman.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

/// Error enum with all possible variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid client configuration (eg: the local node is not part of the cluster list)
    Configuration { reason: String },
    Cluster(crate::cluster::error::Error),
    Lock(crate::lock::error::Error),
    InvalidRequest(InvalidRequest),
    Io { reason: String },
    /// An acquisition task hit an unexpected lock service error. The client refuses to reconcile from then on
    Fatal { reason: String },
    /// The client was closed
    Closed,
    Internal { reason: String },
}

impl Error {
    /// Returns true if this is an instance of a [`Error::Fatal`] variant
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal { .. })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

impl From<crate::cluster::error::Error> for Error {
    fn from(err: crate::cluster::error::Error) -> Self {
        match err {
            crate::cluster::error::Error::OwnNodeNotInCluster { own_node } => {
                Self::Configuration {
                    reason: format!("{} must be part of the cluster list", own_node),
                }
            }
            _ => Self::Cluster(err),
        }
    }
}

impl From<crate::lock::error::Error> for Error {
    fn from(err: crate::lock::error::Error) -> Self {
        Self::Lock(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidRequest {
    MaxMessageSizeExceeded { max: u32, got: u32 },
    MessageReceivedWithoutRequestId,
    MessageRequestIdMustBeUtf8Encoded,
    UnableToConstructCommandFromMessage { expected_id: u8, got: u8 },
    InvalidJsonPayload(String),
    EmptyMessagePayload,
    UnrecognizedCommand { id: u8 },
}
