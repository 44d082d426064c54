//! An in-process [`LockService`] implementation
//!
//! Every [`InMemoryLockService`] is one session over a [`LockTable`]. Sharing the same table between several
//! services simulates several nodes contending for the same locks, which is how the partition ownership
//! logic is tested. On top of the lock semantics, this implementation keeps per path call counters and
//! supports fault injection.
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{event, instrument, Level};

use crate::test_utils::fault::{Fault, When};

use super::{
    connection::{connect_with_retry, ConnectionState, ConnectionStateReporter},
    error::{Error, Result},
    table::{LockTable, SessionId, TryAcquire},
    Acquire, CancelSignal, Lock, LockService,
};

/// How often a blocking acquisition re-checks the table if no release notification arrives
const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    pub n_calls: usize,
}

/// Number of calls received by a single lock path
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LockStats {
    pub acquire: Stats,
    pub cancel: Stats,
    pub release: Stats,
}

impl LockStats {
    pub fn n_calls(&self) -> usize {
        self.acquire.n_calls + self.cancel.n_calls + self.release.n_calls
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryLockFaults {
    /// fails connection attempts (retried by [`LockService::connect`])
    pub connect: Fault,
    /// makes acquisitions report contention. Every lock handle evaluates its own copy
    pub contention: Fault,
    /// makes acquisitions fail with an unexpected error
    pub acquire: Fault,
    /// makes releases fail
    pub release: Fault,
}

#[derive(Debug)]
struct Inner {
    name: String,
    table: Arc<LockTable>,
    session: Mutex<Option<SessionId>>,
    faults: InMemoryLockFaults,
    stats: Mutex<HashMap<String, LockStats>>,
    reporter: ConnectionStateReporter,
    connect_backoff: Duration,
}

impl Inner {
    fn session_guard(&self) -> MutexGuard<Option<SessionId>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> Result<SessionId> {
        self.session_guard().ok_or_else(|| Error::NotConnected {
            addr: self.name.clone(),
        })
    }

    fn record<F: FnOnce(&mut LockStats)>(&self, path: &str, f: F) {
        let mut guard = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(guard.entry(path.to_string()).or_default());
    }
}

/// The InMemory [`LockService`] definition
#[derive(Debug, Clone)]
pub struct InMemoryLockService {
    inner: Arc<Inner>,
}

impl InMemoryLockService {
    /// A service without faults over `table`
    pub fn new(table: Arc<LockTable>) -> Self {
        InMemoryLockServiceBuilder::new(table).build()
    }

    /// Calls received so far for `path`
    pub fn stats(&self, path: &str) -> LockStats {
        let guard = self
            .inner
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard.get(path).cloned().unwrap_or_default()
    }

    /// Calls received so far across every path
    pub fn total_stats(&self) -> LockStats {
        let guard = self
            .inner
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard.values().fold(LockStats::default(), |mut acc, s| {
            acc.acquire.n_calls += s.acquire.n_calls;
            acc.cancel.n_calls += s.cancel.n_calls;
            acc.release.n_calls += s.release.n_calls;
            acc
        })
    }

    /// Simulates the service dropping the session: every lock it held is released and a new session
    /// is started (the way a coordination service client reconnects after its session expired)
    pub fn expire_session(&self) -> Vec<String> {
        let mut guard = self.inner.session_guard();
        match guard.take() {
            Some(session) => {
                let expired = self.inner.table.expire_session(session);
                *guard = Some(self.inner.table.new_session());
                expired
            }
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    fn addr(&self) -> &str {
        &self.inner.name
    }

    #[instrument(name = "lock::in_memory::connect", level = "info", skip(self))]
    async fn connect(&self) -> Result<()> {
        if self.inner.session_guard().is_some() {
            return Ok(());
        }

        let faults = &self.inner.faults;
        connect_with_retry(&self.inner.reporter, self.inner.connect_backoff, || async {
            if faults.connect.fires() {
                Err(Error::Injected {
                    reason: "Mocked error on connect".to_string(),
                })
            } else {
                Ok(())
            }
        })
        .await;

        let mut guard = self.inner.session_guard();
        if guard.is_none() {
            *guard = Some(self.inner.table.new_session());
        }

        Ok(())
    }

    fn lock(&self, path: String, identifier: String) -> Arc<dyn Lock> {
        Arc::new(InMemoryLock {
            path,
            identifier,
            contention: self.inner.faults.contention.fresh(),
            cancel: CancelSignal::default(),
            service: self.inner.clone(),
        })
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.reporter.subscribe()
    }

    async fn close(&self) -> Result<()> {
        let session = self.inner.session_guard().take();
        if let Some(session) = session {
            self.inner.table.expire_session(session);
            self.inner.reporter.report(ConnectionState::Down);
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct InMemoryLock {
    path: String,
    identifier: String,
    contention: Fault,
    cancel: CancelSignal,
    service: Arc<Inner>,
}

impl InMemoryLock {
    fn try_acquire_once(&self) -> Result<bool> {
        let session = self.service.session()?;
        if self.service.faults.acquire.fires() {
            return Err(Error::Injected {
                reason: "Mocked error on acquire".to_string(),
            });
        }

        if self.contention.fires() {
            return Ok(false);
        }

        match self
            .service
            .table
            .try_acquire(&self.path, session, &self.identifier)
        {
            TryAcquire::Acquired => Ok(true),
            TryAcquire::Held { holder } => {
                event!(Level::DEBUG, path = %self.path, holder = %holder, "lock is held");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Lock for InMemoryLock {
    fn path(&self) -> &str {
        &self.path
    }

    async fn acquire(&self, blocking: bool) -> Result<Acquire> {
        self.service
            .record(&self.path, |stats| stats.acquire.n_calls += 1);
        let generation = self.cancel.generation();

        loop {
            let released = self.service.table.released();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.try_acquire_once()? {
                return Ok(Acquire::Acquired);
            }

            if !blocking {
                return Ok(Acquire::NotAcquired);
            }

            tokio::select! {
                _ = self.cancel.cancelled_since(generation) => return Ok(Acquire::Cancelled),
                _ = &mut released => {}
                _ = tokio::time::sleep(BLOCKING_POLL_INTERVAL) => {}
            }
        }
    }

    async fn cancel(&self) {
        self.service
            .record(&self.path, |stats| stats.cancel.n_calls += 1);
        self.cancel.cancel();
    }

    async fn release(&self) -> Result<()> {
        self.service
            .record(&self.path, |stats| stats.release.n_calls += 1);
        let session = self.service.session()?;
        if self.service.faults.release.fires() {
            return Err(Error::Injected {
                reason: "Mocked error on release".to_string(),
            });
        }

        self.service.table.release(&self.path, session)
    }
}

pub struct InMemoryLockServiceBuilder {
    name: String,
    table: Arc<LockTable>,
    faults: InMemoryLockFaults,
    connect_backoff: Duration,
}

impl InMemoryLockServiceBuilder {
    pub fn new(table: Arc<LockTable>) -> Self {
        Self {
            name: "in-memory".to_string(),
            table,
            faults: Default::default(),
            connect_backoff: Duration::from_millis(10),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_connect_fault(mut self, when: When) -> Self {
        self.faults.connect = Fault::new(when);
        self
    }

    pub fn with_contention_fault(mut self, when: When) -> Self {
        self.faults.contention = Fault::new(when);
        self
    }

    pub fn with_acquire_fault(mut self, when: When) -> Self {
        self.faults.acquire = Fault::new(when);
        self
    }

    pub fn with_release_fault(mut self, when: When) -> Self {
        self.faults.release = Fault::new(when);
        self
    }

    pub fn with_connect_backoff(mut self, backoff: Duration) -> Self {
        self.connect_backoff = backoff;
        self
    }

    pub fn build(self) -> InMemoryLockService {
        InMemoryLockService {
            inner: Arc::new(Inner {
                reporter: ConnectionStateReporter::new(self.name.clone()),
                name: self.name,
                table: self.table,
                session: Mutex::new(None),
                faults: self.faults,
                stats: Default::default(),
                connect_backoff: self.connect_backoff,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{InMemoryLockService, InMemoryLockServiceBuilder};
    use crate::{
        lock::{connection::ConnectionState, error::Error, table::LockTable, Acquire, LockService},
        test_utils::fault::When,
    };

    #[quickcheck_async::tokio]
    async fn only_one_session_acquires(n_contenders: u8) {
        let table = Arc::new(LockTable::default());
        let mut n_acquired = 0;
        for i in 0..(n_contenders as usize % 8 + 1) {
            let service = InMemoryLockService::new(table.clone());
            service.connect().await.unwrap();
            let lock = service.lock("/p/0".to_string(), i.to_string());
            if lock.acquire(false).await.unwrap() == Acquire::Acquired {
                n_acquired += 1;
            }
        }

        assert_eq!(n_acquired, 1);
    }

    #[tokio::test]
    async fn acquire_requires_connect() {
        let service = InMemoryLockServiceBuilder::new(Arc::new(LockTable::default()))
            .with_name("zk-test")
            .build();
        assert_eq!(service.addr(), "zk-test");
        let lock = service.lock("/p/0".to_string(), "A".to_string());
        assert_eq!(
            lock.acquire(false).await,
            Err(Error::NotConnected {
                addr: "zk-test".to_string()
            })
        );

        service.connect().await.unwrap();
        assert_eq!(lock.acquire(false).await.unwrap(), Acquire::Acquired);
        assert_eq!(service.stats("/p/0").acquire.n_calls, 2);
    }

    #[tokio::test]
    async fn contention_between_sessions() {
        let table = Arc::new(LockTable::default());
        let a = InMemoryLockService::new(table.clone());
        let b = InMemoryLockService::new(table.clone());
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        let lock_a = a.lock("/p/0".to_string(), "A".to_string());
        let lock_b = b.lock("/p/0".to_string(), "B".to_string());
        assert_eq!(lock_a.acquire(false).await.unwrap(), Acquire::Acquired);
        assert_eq!(lock_b.acquire(false).await.unwrap(), Acquire::NotAcquired);

        // a blocking acquisition goes through as soon as the holder releases
        let waiter = {
            let lock_b = lock_b.clone();
            tokio::spawn(async move { lock_b.acquire(true).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        lock_a.release().await.unwrap();

        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(res, Acquire::Acquired);
        assert_eq!(table.holder("/p/0"), Some("B".to_string()));
    }

    #[tokio::test]
    async fn cancel_interrupts_blocking_acquire() {
        let table = Arc::new(LockTable::default());
        let a = InMemoryLockService::new(table.clone());
        let b = InMemoryLockService::new(table.clone());
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        a.lock("/p/0".to_string(), "A".to_string())
            .acquire(false)
            .await
            .unwrap();
        let lock_b = b.lock("/p/0".to_string(), "B".to_string());

        let waiter = {
            let lock_b = lock_b.clone();
            tokio::spawn(async move { lock_b.acquire(true).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        lock_b.cancel().await;

        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(res, Acquire::Cancelled);
        assert_eq!(table.holder("/p/0"), Some("A".to_string()));
    }

    #[tokio::test]
    async fn close_releases_session_locks() {
        let table = Arc::new(LockTable::default());
        let service = InMemoryLockService::new(table.clone());
        let mut state = service.connection_state();
        service.connect().await.unwrap();
        assert_eq!(*state.borrow_and_update(), ConnectionState::Up);

        let lock = service.lock("/p/0".to_string(), "A".to_string());
        lock.acquire(false).await.unwrap();

        service.close().await.unwrap();
        assert_eq!(*state.borrow_and_update(), ConnectionState::Down);
        assert_eq!(table.holder("/p/0"), None);
        assert!(lock.release().await.is_err());
    }

    #[tokio::test]
    async fn connect_retries_through_faults() {
        let service = InMemoryLockServiceBuilder::new(Arc::new(LockTable::default()))
            .with_connect_fault(When::FirstN(3))
            .with_connect_backoff(Duration::from_millis(1))
            .build();

        service.connect().await.unwrap();
        assert_eq!(*service.connection_state().borrow(), ConnectionState::Up);
    }

    #[tokio::test]
    async fn expired_session_loses_locks() {
        let table = Arc::new(LockTable::default());
        let service = InMemoryLockService::new(table.clone());
        service.connect().await.unwrap();
        let lock = service.lock("/p/0".to_string(), "A".to_string());
        lock.acquire(false).await.unwrap();

        assert_eq!(service.expire_session(), vec!["/p/0".to_string()]);
        assert!(matches!(
            lock.release().await,
            Err(Error::NotHeld { .. })
        ));
        // the new session can acquire again
        assert_eq!(lock.acquire(false).await.unwrap(), Acquire::Acquired);
    }
}
