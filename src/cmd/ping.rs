use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::CommandId;

#[derive(Debug)]
pub struct Ping;

#[derive(Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub message: String,
}

impl Ping {
    pub async fn execute(self) -> Result<PingResponse> {
        Ok(PingResponse {
            message: "PONG".to_string(),
        })
    }

    pub fn cmd_id() -> CommandId {
        CommandId::Ping
    }
}

impl crate::server::message::IntoMessage for Ping {
    fn cmd_id(&self) -> CommandId {
        Self::cmd_id()
    }

    fn payload(&self) -> Option<Bytes> {
        None
    }
}
