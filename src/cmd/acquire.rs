use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{event, Level};

use crate::error::Result;
use crate::lock::table::{LockTable, SessionId, TryAcquire};
use crate::server::message::IntoMessage;

use super::CommandId;

/// Single non-blocking attempt to acquire `path` for the calling session, contended for as `owner`
#[derive(Debug, Serialize, Deserialize)]
pub struct Acquire {
    path: String,
    owner: String,
}

impl Acquire {
    pub fn new(path: String, owner: String) -> Self {
        Self { path, owner }
    }

    pub async fn execute(self, table: &LockTable, session: SessionId) -> Result<AcquireResponse> {
        match table.try_acquire(&self.path, session, &self.owner) {
            TryAcquire::Acquired => Ok(AcquireResponse {
                acquired: true,
                holder: None,
            }),
            TryAcquire::Held { holder } => {
                event!(
                    Level::DEBUG,
                    path = %self.path,
                    holder = %holder,
                    session,
                    "acquire rejected, lock is held"
                );
                Ok(AcquireResponse {
                    acquired: false,
                    holder: Some(holder),
                })
            }
        }
    }

    pub fn cmd_id() -> CommandId {
        CommandId::Acquire
    }
}

impl IntoMessage for Acquire {
    fn cmd_id(&self) -> CommandId {
        Self::cmd_id()
    }

    fn payload(&self) -> Option<Bytes> {
        serde_json::to_vec(self).ok().map(Bytes::from)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcquireResponse {
    pub acquired: bool,
    /// identity of the current holder when the lock was not acquired
    pub holder: Option<String>,
}
