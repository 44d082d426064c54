//! Lock service connection state tracking.
//!
//! Connection transitions are logged, exported as the `partman_lock_service_connection_state` gauge (tagged by
//! address) and published on a [`watch`] channel. The partition client only reacts to
//! [`ConnectionState::Down`] after it connected: the session is gone and so is every lock it held.
use std::{future::Future, time::Duration};

use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter};
use tokio::sync::watch;
use tracing::{event, Level};

use super::error::Result;

const CONNECTION_STATE_GAUGE: &str = "partman_lock_service_connection_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ConnectionState {
    Init,
    Up,
    Down,
}

#[derive(Debug)]
pub struct ConnectionStateReporter {
    addr: String,
    tx: watch::Sender<ConnectionState>,
}

impl ConnectionStateReporter {
    /// Creates a reporter in the [`ConnectionState::Init`] state
    pub fn new(addr: String) -> Self {
        let (tx, _) = watch::channel(ConnectionState::Init);
        let reporter = Self { addr, tx };
        reporter.export(ConnectionState::Init);
        event!(Level::INFO, addr = %reporter.addr, state = %ConnectionState::Init, "lock service connection state");
        reporter
    }

    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Records a transition. Reporting the current state again is a noop
    pub fn report(&self, state: ConnectionState) {
        let previous = self.tx.send_replace(state);
        if previous == state {
            return;
        }

        event!(
            Level::INFO,
            addr = %self.addr,
            from = %previous,
            to = %state,
            "lock service connection state changed"
        );
        self.export(state);
    }

    fn export(&self, current: ConnectionState) {
        for state in ConnectionState::iter() {
            let value = if state == current { 1.0 } else { 0.0 };
            metrics::gauge!(
                CONNECTION_STATE_GAUGE,
                "addr" => self.addr.clone(),
                "state" => state.as_ref().to_string()
            )
            .set(value);
        }
    }
}

/// Calls `attempt` until it succeeds, sleeping `backoff` between attempts.
///
/// Every failure is reported as [`ConnectionState::Down`] and the final success as [`ConnectionState::Up`].
/// There is no retry limit: a lock service that is not up yet should only delay the caller.
pub async fn connect_with_retry<T, F, Fut>(
    reporter: &ConnectionStateReporter,
    backoff: Duration,
    mut attempt: F,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut n_attempts: usize = 0;
    loop {
        n_attempts += 1;
        match attempt().await {
            Ok(value) => {
                reporter.report(ConnectionState::Up);
                return value;
            }
            Err(err) => {
                event!(
                    Level::WARN,
                    addr = %reporter.addr,
                    n_attempts,
                    "Unable to connect to lock service, retrying in {:?}: {}",
                    backoff,
                    err
                );
                reporter.report(ConnectionState::Down);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
