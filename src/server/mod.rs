//! This file contains 2 things
//!  1. the TCP listener implementation of the lock server
//!    - It accepts tcp connections. Every connection is a lock session
//!    - tries to parse a [`Message`] out of the connection
//!    - tries to construct a [`Command`] out of the parsed Message
//!    - executes the command against the shared [`LockTable`]
//!    - writes the response back to the client
//!    - once the connection goes away, every lock held by its session is released
//!  2. The Request protocol (see [`message`])
use std::{future::Future, net::SocketAddr, path::PathBuf, sync::Arc};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Instrument, Level};

use crate::{
    cmd::{serialize_result, Command},
    error::Result,
    lock::table::{LockTable, SessionId},
};

use self::config::Config;
use self::message::Message;

pub mod config;
pub mod message;

tokio::task_local! {
    /// Request id of the message being handled, echoed back in the response
    pub static REQUEST_ID: String;
}

pub struct Server {
    listener: TcpListener,
    table: Arc<LockTable>,
}

impl Server {
    pub async fn from_config(path: PathBuf) -> anyhow::Result<Self> {
        let c = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&c)?;
        Self::new(config).await
    }

    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(format!("{}:{}", config.host, config.port)).await?;
        Ok(Self {
            listener,
            table: Arc::new(LockTable::default()),
        })
    }

    /// The address the listener is bound to
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves. Sessions still open at that point are closed
    /// and their locks released.
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        event!(Level::INFO, %addr, "Lock server listener started");
        let sessions = CancellationToken::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((tcp_stream, peer)) => {
                            let session = self.table.new_session();
                            let span = tracing::info_span!("session", session, %peer);
                            tokio::spawn(
                                handle_connection(tcp_stream, self.table.clone(), session, sessions.child_token())
                                    .instrument(span),
                            );
                        }
                        Err(err) => {
                            event!(Level::WARN, "Unable to accept connection: {}", err);
                        }
                    }
                }
                _ = &mut shutdown => {
                    event!(Level::INFO, "Lock server shutting down");
                    sessions.cancel();
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    mut tcp_stream: TcpStream,
    table: Arc<LockTable>,
    session: SessionId,
    shutdown: CancellationToken,
) {
    event!(Level::INFO, "session opened");
    if let Err(err) = serve_session(&mut tcp_stream, &table, session, &shutdown).await {
        // EOF ends up here as well, which is how clients normally close their session
        event!(Level::DEBUG, "connection closed: {}", err);
    }

    let expired = table.expire_session(session);
    event!(
        Level::INFO,
        n_released_locks = expired.len(),
        "session closed"
    );
}

#[instrument(level = "debug", skip_all)]
async fn serve_session(
    tcp_stream: &mut TcpStream,
    table: &LockTable,
    session: SessionId,
    shutdown: &CancellationToken,
) -> Result<()> {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            message = Message::try_from_async_read(tcp_stream) => message?,
        };

        let cmd_id = message.cmd_id;
        let request_id = message.request_id.clone();
        let response = REQUEST_ID
            .scope(request_id.clone(), async {
                match Command::try_from_message(message) {
                    Ok(cmd) => cmd.execute(table, session).await,
                    // the frame was fully read, so the connection can keep going
                    Err(err) => Message::new(cmd_id, request_id, serialize_result::<()>(&Err(err))),
                }
            })
            .await;

        tcp_stream.write_all(&response.serialize()).await?;
    }
}
