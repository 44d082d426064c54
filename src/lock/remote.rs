//! A [`LockService`] that talks to the lock [`crate::server::Server`] over TCP.
//!
//! The TCP connection is the session: dropping it releases every lock acquired through it. For that reason the
//! connection is never silently re-established once it was lost. Every following call fails with
//! [`Error::NotConnected`] and the caller decides what to do with locks it believed it held.
//!
//! While connected, a heartbeat task pings the server every `heartbeat_interval`. An idle session that dies is
//! noticed that way and reported as [`ConnectionState::Down`].
use std::{
    sync::{Arc, Mutex as StdMutex, PoisonError, Weak},
    time::Duration,
};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::{io::AsyncWriteExt, net::TcpStream, sync::watch, sync::Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

use crate::{
    cmd::{
        acquire::{Acquire as AcquireCommand, AcquireResponse},
        ping::{Ping, PingResponse},
        release::{Release as ReleaseCommand, ReleaseResponse},
    },
    server::message::Message,
    utils::generate_random_ascii_string,
};

use super::{
    connection::{connect_with_retry, ConnectionState, ConnectionStateReporter},
    error::{Error, Result},
    Acquire, CancelSignal, Lock, LockService,
};

/// Interval between two attempts of a blocking acquisition
pub const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(100);
const REQUEST_ID_LEN: usize = 16;

#[derive(Debug)]
struct Inner {
    addr: String,
    connection: Mutex<Option<TcpStream>>,
    reporter: ConnectionStateReporter,
    connect_backoff: Duration,
    heartbeat_interval: Duration,
    /// stops the heartbeat of the current connection
    heartbeat: StdMutex<Option<CancellationToken>>,
}

async fn roundtrip(conn: &mut TcpStream, message: Message) -> Result<Message> {
    conn.write_all(&message.serialize()).await?;
    Ok(Message::try_from_async_read(conn).await?)
}

fn decode<T: DeserializeOwned>(request_id: &str, response: Message) -> Result<T> {
    if response.request_id != request_id {
        return Err(Error::InvalidServerResponse {
            reason: format!(
                "expected response to request {} but got {}",
                request_id, response.request_id
            ),
        });
    }

    let payload = response.payload.ok_or_else(|| Error::InvalidServerResponse {
        reason: "response without payload".to_string(),
    })?;
    let result: std::result::Result<T, crate::error::Error> = serde_json::from_slice(&payload)?;
    Ok(result?)
}

fn with_request_id(mut message: Message) -> Message {
    message.request_id = generate_random_ascii_string(REQUEST_ID_LEN);
    message
}

/// Opens a connection and makes sure a lock server is on the other side
async fn open(addr: &str) -> Result<TcpStream> {
    let mut conn = TcpStream::connect(addr).await?;
    let ping = with_request_id(Message::from(Ping));
    let request_id = ping.request_id.clone();
    let response: PingResponse = decode(&request_id, roundtrip(&mut conn, ping).await?)?;
    if response.message != "PONG" {
        return Err(Error::InvalidServerResponse {
            reason: format!("unexpected ping response {}", response.message),
        });
    }

    Ok(conn)
}

impl Inner {
    async fn request<T: DeserializeOwned>(&self, message: Message) -> Result<T> {
        let message = with_request_id(message);
        let request_id = message.request_id.clone();

        let mut guard = self.connection.lock().await;
        let conn = guard.as_mut().ok_or_else(|| Error::NotConnected {
            addr: self.addr.clone(),
        })?;

        match roundtrip(conn, message).await {
            Ok(response) => decode(&request_id, response),
            Err(err) => {
                event!(
                    Level::WARN,
                    addr = %self.addr,
                    "lock service connection lost: {}",
                    err
                );
                *guard = None;
                self.reporter.report(ConnectionState::Down);
                Err(err)
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        let response: PingResponse = self.request(Message::from(Ping)).await?;
        if response.message != "PONG" {
            return Err(Error::InvalidServerResponse {
                reason: format!("unexpected ping response {}", response.message),
            });
        }

        Ok(())
    }

    fn stop_heartbeat(&self) {
        let token = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }
}

/// Pings the server until the connection is lost, `token` is cancelled or the service is dropped
async fn heartbeat(inner: Weak<Inner>, interval: Duration, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        if token.is_cancelled() {
            return;
        }
        if let Err(err) = inner.ping().await {
            event!(Level::ERROR, addr = %inner.addr, "lock service heartbeat failed: {}", err);
            if token.is_cancelled() {
                return;
            }
            // a server that answers pings wrongly can't be trusted with the session either
            inner.connection.lock().await.take();
            inner.reporter.report(ConnectionState::Down);
            return;
        }
    }
}

/// The TCP [`LockService`] definition
#[derive(Debug, Clone)]
pub struct RemoteLockService {
    inner: Arc<Inner>,
}

impl RemoteLockService {
    pub fn new(addr: String, connect_backoff: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                reporter: ConnectionStateReporter::new(addr.clone()),
                addr,
                connection: Mutex::new(None),
                connect_backoff,
                heartbeat_interval,
                heartbeat: StdMutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl LockService for RemoteLockService {
    fn addr(&self) -> &str {
        &self.inner.addr
    }

    #[instrument(name = "lock::remote::connect", level = "info", skip(self), fields(addr = %self.inner.addr))]
    async fn connect(&self) -> Result<()> {
        let mut guard = self.inner.connection.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let addr = self.inner.addr.as_str();
        let conn = connect_with_retry(&self.inner.reporter, self.inner.connect_backoff, || {
            open(addr)
        })
        .await;
        *guard = Some(conn);

        let token = CancellationToken::new();
        tokio::spawn(heartbeat(
            Arc::downgrade(&self.inner),
            self.inner.heartbeat_interval,
            token.clone(),
        ));
        let previous = self
            .inner
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token);
        if let Some(previous) = previous {
            previous.cancel();
        }

        Ok(())
    }

    fn lock(&self, path: String, identifier: String) -> Arc<dyn Lock> {
        Arc::new(RemoteLock {
            path,
            identifier,
            cancel: CancelSignal::default(),
            service: self.inner.clone(),
        })
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.reporter.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.inner.stop_heartbeat();
        let conn = self.inner.connection.lock().await.take();
        if let Some(mut conn) = conn {
            if let Err(err) = conn.shutdown().await {
                event!(Level::DEBUG, "error shutting down connection: {}", err);
            }
            self.inner.reporter.report(ConnectionState::Down);
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct RemoteLock {
    path: String,
    identifier: String,
    cancel: CancelSignal,
    service: Arc<Inner>,
}

#[async_trait]
impl Lock for RemoteLock {
    fn path(&self) -> &str {
        &self.path
    }

    async fn acquire(&self, blocking: bool) -> Result<Acquire> {
        let generation = self.cancel.generation();
        loop {
            let response: AcquireResponse = self
                .service
                .request(Message::from(AcquireCommand::new(
                    self.path.clone(),
                    self.identifier.clone(),
                )))
                .await?;

            if response.acquired {
                return Ok(Acquire::Acquired);
            }

            event!(
                Level::DEBUG,
                path = %self.path,
                holder = ?response.holder,
                "lock is held"
            );
            if !blocking {
                return Ok(Acquire::NotAcquired);
            }

            tokio::select! {
                _ = self.cancel.cancelled_since(generation) => return Ok(Acquire::Cancelled),
                _ = tokio::time::sleep(BLOCKING_POLL_INTERVAL) => {}
            }
        }
    }

    async fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn release(&self) -> Result<()> {
        let _: ReleaseResponse = self
            .service
            .request(Message::from(ReleaseCommand::new(self.path.clone())))
            .await?;
        Ok(())
    }
}
