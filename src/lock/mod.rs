//! Module that contains the distributed lock service abstraction used to confirm partition ownership.
//!
//! A [`LockService`] is a connection (session) to a coordination service. It hands out one [`Lock`] per path,
//! identified by the contender's identity. Locks are ephemeral: if the session goes away, every lock held
//! through it is released by the service.
//!
//! Two implementations are provided:
//!  1. [`in_memory::InMemoryLockService`] - an in-process lock table, shared by every service created over it.
//!  2. [`remote::RemoteLockService`] - a TCP client for the lock server in [`crate::server`].
use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio::sync::{watch, Notify};

use self::{connection::ConnectionState, error::Result};

pub mod connection;
pub mod error;
pub mod in_memory;
pub mod remote;
pub mod table;

/// Root of every partition lock path
pub const LOCK_PATH_ROOT: &str = "/lockpath";

/// Builds the lock path for a partition: `/lockpath/<app_name>/<partition>`.
/// Deployments sharing a lock service rely on this exact layout.
pub fn lock_path(app_name: &str, partition: u32) -> String {
    format!("{}/{}/{}", LOCK_PATH_ROOT, app_name, partition)
}

/// Outcome of a [`Lock::acquire`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The caller holds the lock
    Acquired,
    /// Someone else holds the lock. Routine contention, not an error
    NotAcquired,
    /// The acquisition was aborted by [`Lock::cancel`]
    Cancelled,
}

/// A handle to a single lock path
#[async_trait]
pub trait Lock: Debug + Send + Sync {
    /// The path this lock refers to
    fn path(&self) -> &str;

    /// Tries to acquire the lock.
    ///
    /// With `blocking == false` a single attempt is made. With `blocking == true` the call only returns once the
    /// lock is acquired or the acquisition is cancelled.
    async fn acquire(&self, blocking: bool) -> Result<Acquire>;

    /// Aborts any in-flight blocking acquisition, which then returns [`Acquire::Cancelled`]
    async fn cancel(&self);

    /// Releases the lock.
    ///
    /// # Errors
    /// [`error::Error::NotHeld`] if the caller's session doesn't hold it (eg: the session already expired)
    async fn release(&self) -> Result<()>;
}

#[async_trait]
pub trait LockService: Debug + Send + Sync {
    /// Address (or name) of the lock service, used to tag connection state reports
    fn addr(&self) -> &str;

    /// Establishes the session. Transient failures are retried forever, so this only returns once connected
    async fn connect(&self) -> Result<()>;

    /// Creates a [`Lock`] handle for `path`, contended for as `identifier`
    fn lock(&self, path: String, identifier: String) -> Arc<dyn Lock>;

    /// Subscribes to connection state transitions
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Terminates the session. Every lock held through it is released by the service
    async fn close(&self) -> Result<()>;
}

/// Cancellation primitive shared by the [`Lock`] implementations.
///
/// Every call to [`CancelSignal::cancel`] starts a new generation. A blocking acquisition records the generation
/// it started on and is cancelled as soon as it changes.
#[derive(Debug, Default)]
pub struct CancelSignal {
    generation: AtomicU64,
    notify: Notify,
}

impl CancelSignal {
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Resolves once [`CancelSignal::cancel`] is called after `generation` was observed
    pub async fn cancelled_since(&self, generation: u64) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.generation() != generation {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{lock_path, CancelSignal};

    #[test]
    fn lock_path_layout() {
        assert_eq!(lock_path("svc-monitor", 7), "/lockpath/svc-monitor/7");
    }

    #[tokio::test]
    async fn cancel_signal_wakes_waiters() {
        let signal = Arc::new(CancelSignal::default());
        let generation = signal.generation();

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled_since(generation).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        signal.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_before_wait_is_observed() {
        let signal = CancelSignal::default();
        let generation = signal.generation();
        signal.cancel();
        tokio::time::timeout(Duration::from_secs(1), signal.cancelled_since(generation))
            .await
            .unwrap();
    }
}
