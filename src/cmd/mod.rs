//! Module that contains all commands implemented by the lock server.
//!
//! # Design principals
//! Commands have 2 responsibilities:
//!  1. Parse request params (basically serde_json calls)
//!  2. Construct responses that are sent back to callers
//!
//! Everything else should be delegated to the [`crate::lock::table`] layer.
pub mod acquire;
pub mod ping;
pub mod release;

use acquire::Acquire as AcquireCommand;
use bytes::Bytes;
use ping::Ping as PingCommand;
use release::Release as ReleaseCommand;
use serde::Serialize;
use tracing::{event, instrument, Level};

use crate::{
    error::{Error, InvalidRequest, Result},
    lock::table::{LockTable, SessionId},
    server::message::{IntoMessage, Message},
};

/// Command ids used to figure out the layout of the payload to be parsed from a [`Message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    Ping = 1,
    Acquire = 2,
    Release = 3,
}

impl TryFrom<u8> for CommandId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Ping),
            2 => Ok(Self::Acquire),
            3 => Ok(Self::Release),
            _ => Err(Error::InvalidRequest(InvalidRequest::UnrecognizedCommand {
                id: value,
            })),
        }
    }
}

/// Command definition - this enum contains all commands implemented by the lock server.
#[derive(Debug)]
pub enum Command {
    Ping(PingCommand),
    Acquire(AcquireCommand),
    Release(ReleaseCommand),
}

/// macro that tries to construct a specific [`Command`] from a [`Message`]
macro_rules! try_from_message_with_payload {
    ($message:expr, $t:ident) => {{
        (|| {
            if $message.cmd_id != $t::cmd_id() as u8 {
                return Err(Error::InvalidRequest(
                    InvalidRequest::UnableToConstructCommandFromMessage {
                        expected_id: $t::cmd_id() as u8,
                        got: $message.cmd_id,
                    },
                ));
            }

            if let Some(payload) = $message.payload {
                let s: $t = serde_json::from_slice(&payload).map_err(|e| {
                    Error::InvalidRequest(InvalidRequest::InvalidJsonPayload(e.to_string()))
                })?;
                Ok(s)
            } else {
                return Err(Error::InvalidRequest(InvalidRequest::EmptyMessagePayload));
            }
        })()
    }};
}

/// The outcome of a command, sent back with the same [`CommandId`] as the request
pub struct CommandResponse<T> {
    cmd_id: CommandId,
    result: Result<T>,
}

impl<T: Serialize> IntoMessage for CommandResponse<T> {
    fn cmd_id(&self) -> CommandId {
        self.cmd_id
    }

    fn payload(&self) -> Option<Bytes> {
        serialize_result(&self.result)
    }
}

/// Serializes a command result as `{"Ok": ..}` or `{"Err": ..}`
pub fn serialize_result<T: Serialize>(result: &Result<T>) -> Option<Bytes> {
    match serde_json::to_vec(result) {
        Ok(payload) => Some(Bytes::from(payload)),
        Err(err) => {
            event!(Level::ERROR, "Unable to serialize response: {}", err);
            None
        }
    }
}

impl Command {
    /// Executes a given command on behalf of `session`
    #[instrument(name = "cmd::execute", level = "debug", skip(table))]
    pub async fn execute(self, table: &LockTable, session: SessionId) -> Message {
        match self {
            Command::Ping(cmd) => CommandResponse {
                cmd_id: PingCommand::cmd_id(),
                result: cmd.execute().await,
            }
            .into(),
            Command::Acquire(cmd) => CommandResponse {
                cmd_id: AcquireCommand::cmd_id(),
                result: cmd.execute(table, session).await,
            }
            .into(),
            Command::Release(cmd) => CommandResponse {
                cmd_id: ReleaseCommand::cmd_id(),
                result: cmd.execute(table, session).await,
            }
            .into(),
        }
    }

    /// Tries to construct a [`Command`] from the provided [`Message`]
    ///
    /// # Errors
    /// returns an error if the payload doesn't conform with the specified [`Command`]
    #[instrument(level = "debug")]
    pub fn try_from_message(message: Message) -> Result<Command> {
        match CommandId::try_from(message.cmd_id) {
            Ok(CommandId::Ping) => Ok(Command::Ping(PingCommand)),
            Ok(CommandId::Acquire) => Ok(Command::Acquire(try_from_message_with_payload!(
                message,
                AcquireCommand
            )?)),
            Ok(CommandId::Release) => Ok(Command::Release(try_from_message_with_payload!(
                message,
                ReleaseCommand
            )?)),
            Err(err) => {
                event!(Level::WARN, "Unrecognized command: {}", message.cmd_id);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{acquire::Acquire, release::Release, Command};
    use crate::error::{Error, InvalidRequest};
    use crate::lock::table::LockTable;
    use crate::server::message::Message;

    #[test]
    fn invalid_request_mixed_message_id() {
        let acquire_cmd = Release::new("/lockpath/app/0".to_string());
        let mut message = Message::from(acquire_cmd);
        message.cmd_id = Acquire::cmd_id() as u8;

        let err = Command::try_from_message(message).err().unwrap();
        match err {
            Error::InvalidRequest(InvalidRequest::InvalidJsonPayload(_)) => {}
            _ => {
                panic!("Unexpected error: {}", err);
            }
        }
    }

    #[test]
    fn invalid_request_unrecognized_command() {
        let mut message = Message::from(Release::new("/lockpath/app/0".to_string()));
        message.cmd_id = 99;

        let err = Command::try_from_message(message).err().unwrap();
        match err {
            Error::InvalidRequest(InvalidRequest::UnrecognizedCommand { id }) => {
                assert_eq!(id, 99);
            }
            _ => {
                panic!("Unexpected error: {}", err);
            }
        }
    }

    #[test]
    fn invalid_request_empty_payload() {
        let mut message = Message::from(Acquire::new(
            "/lockpath/app/0".to_string(),
            "node-a".to_string(),
        ));
        message.payload = None;

        let err = Command::try_from_message(message).err().unwrap();
        match err {
            Error::InvalidRequest(InvalidRequest::EmptyMessagePayload) => {}
            _ => {
                panic!("Unexpected error: {}", err);
            }
        }
    }

    #[tokio::test]
    async fn acquire_then_release_responses() {
        let table = LockTable::default();
        let s1 = table.new_session();
        let s2 = table.new_session();

        let acquire = |owner: &str| {
            Command::try_from_message(Message::from(Acquire::new(
                "/lockpath/app/0".to_string(),
                owner.to_string(),
            )))
            .unwrap()
        };

        let response = acquire("node-a").execute(&table, s1).await;
        assert_eq!(response.cmd_id, Acquire::cmd_id() as u8);
        let payload: serde_json::Value =
            serde_json::from_slice(&response.payload.unwrap()).unwrap();
        assert_eq!(
            payload,
            serde_json::json!({"Ok": {"acquired": true, "holder": null}})
        );

        let response = acquire("node-b").execute(&table, s2).await;
        let payload: serde_json::Value =
            serde_json::from_slice(&response.payload.unwrap()).unwrap();
        assert_eq!(
            payload,
            serde_json::json!({"Ok": {"acquired": false, "holder": "node-a"}})
        );

        let release = Command::try_from_message(Message::from(Release::new(
            "/lockpath/app/0".to_string(),
        )))
        .unwrap();
        let response = release.execute(&table, s2).await;
        let payload: serde_json::Value =
            serde_json::from_slice(&response.payload.unwrap()).unwrap();
        assert_eq!(
            payload,
            serde_json::json!({"Err": {"Lock": {"NotHeld": {"path": "/lockpath/app/0"}}}})
        );
    }
}
