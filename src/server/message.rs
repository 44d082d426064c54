//! This module contains the definition of a [`Message`] - the smallest unit of parseable bytes exchanged with the
//! lock [`crate::server::Server`].
//!
//! When serialized, a [`Message`] looks like the following:
//!
//! [1 byte - cmd_id][4 bytes - request_id len][request_id][4 bytes - length of payload][payload]
use std::mem::size_of;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{event, instrument, Level};

use crate::{
    cmd::CommandId,
    error::{Error, InvalidRequest, Result},
};

use super::REQUEST_ID;

/// Kind of arbitrary but let's make sure a single connection can't consume more
/// than 1Mb of memory...
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// The unit of the protocol built on top of TCP
/// that the lock server uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Used as a way of identifying the format of the payload for deserialization.
    /// Kept as a raw byte so that a frame with an unknown command can still be read (and answered) in full
    pub cmd_id: u8,
    /// A unique request identifier - used for request tracing and debugging
    /// Note that this has to be encoded as utf8 otherwise parsing the message will fail
    pub request_id: String,
    /// the Request payload
    pub payload: Option<Bytes>,
}

/// A trait that has to be implemented for any structs/enums that can be transformed into a [`Message`]
pub trait IntoMessage {
    /// Same as [`Message::cmd_id`]
    fn cmd_id(&self) -> CommandId;
    /// Same as [`Message::payload`]
    fn payload(&self) -> Option<Bytes> {
        None
    }
    fn request_id(&self) -> String {
        REQUEST_ID
            .try_with(|rid| rid.clone())
            .unwrap_or("NOT_SET".to_string())
    }
}

impl Message {
    /// Constructs a new [`Message`] with the given id and payload
    pub fn new(cmd_id: u8, request_id: String, payload: Option<Bytes>) -> Self {
        Self {
            cmd_id,
            request_id,
            payload,
        }
    }

    /// This function tries to construct a [`Message`] by reading bytes from the provided [`AsyncRead`] source
    /// # Errors
    /// This functions returns errors in the following cases
    ///  1. The message size is bigger than [`MAX_MESSAGE_SIZE`]
    ///  2. The message has an empty or non utf8 request id
    ///  3. The message is somehow malformed (eg: less bytes were provided than the length received)
    #[instrument(level = "debug", skip(reader))]
    pub async fn try_from_async_read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        event!(Level::TRACE, "Will read id");
        let cmd_id = reader.read_u8().await?;

        event!(Level::TRACE, "Will read request_id_len");
        let request_id_length = reader.read_u32().await?;
        if request_id_length == 0 {
            return Err(Error::InvalidRequest(
                InvalidRequest::MessageReceivedWithoutRequestId,
            ));
        }

        if request_id_length > MAX_MESSAGE_SIZE {
            return Err(Error::InvalidRequest(
                InvalidRequest::MaxMessageSizeExceeded {
                    max: MAX_MESSAGE_SIZE,
                    got: request_id_length,
                },
            ));
        }

        let request_id = {
            let mut buf = vec![0u8; request_id_length as usize];
            reader.read_exact(&mut buf).await?;
            String::from_utf8(buf).map_err(|_| {
                Error::InvalidRequest(InvalidRequest::MessageRequestIdMustBeUtf8Encoded)
            })?
        };

        event!(Level::TRACE, "will read payload length");
        let payload_length = reader.read_u32().await?;

        let payload = if payload_length > 0 {
            let total = payload_length.saturating_add(request_id_length);
            if total > MAX_MESSAGE_SIZE {
                return Err(Error::InvalidRequest(
                    InvalidRequest::MaxMessageSizeExceeded {
                        max: MAX_MESSAGE_SIZE,
                        got: total,
                    },
                ));
            }
            let mut buf = vec![0u8; payload_length as usize];
            event!(Level::TRACE, "Will read payload of len: {}", payload_length);
            reader.read_exact(&mut buf).await?;
            Some(buf.into())
        } else {
            None
        };

        Ok(Self {
            cmd_id,
            request_id,
            payload,
        })
    }

    /// Serializes a [`Message`] struct into it's serialized format (see top level comment for format)
    pub fn serialize(self) -> Bytes {
        let payload_len = self.payload.as_ref().map_or(0, |payload| payload.len());
        let mut buf = BytesMut::with_capacity(
            self.request_id.len() + payload_len + 2 * size_of::<u32>() + size_of::<u8>(),
        );

        buf.put_u8(self.cmd_id);
        buf.put_u32(self.request_id.len() as u32);
        buf.put(self.request_id.as_bytes());
        buf.put_u32(payload_len as u32);
        if let Some(payload) = self.payload {
            event!(Level::TRACE, "Will serialize payload: {:?}", payload);
            buf.put(payload);
        }

        buf.freeze()
    }
}

impl<M: IntoMessage> From<M> for Message {
    fn from(v: M) -> Self {
        Self {
            cmd_id: v.cmd_id() as u8,
            request_id: v.request_id(),
            payload: v.payload(),
        }
    }
}
