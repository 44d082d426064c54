use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::lock::table::{LockTable, SessionId};
use crate::server::message::IntoMessage;

use super::CommandId;

#[derive(Debug, Serialize, Deserialize)]
pub struct Release {
    path: String,
}

impl Release {
    pub fn new(path: String) -> Self {
        Self { path }
    }

    pub async fn execute(self, table: &LockTable, session: SessionId) -> Result<ReleaseResponse> {
        table.release(&self.path, session)?;
        Ok(ReleaseResponse {
            message: "Ok".to_string(),
        })
    }

    pub fn cmd_id() -> CommandId {
        CommandId::Release
    }
}

impl IntoMessage for Release {
    fn cmd_id(&self) -> CommandId {
        Self::cmd_id()
    }

    fn payload(&self) -> Option<Bytes> {
        serde_json::to_vec(self).ok().map(Bytes::from)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub message: String,
}
