//! The [`LockTable`] is the source of truth for who holds which lock.
//!
//! Locks are owned by sessions. A session is a single connection to the lock service (a TCP connection for the
//! [`crate::server::Server`], a service instance for [`super::in_memory::InMemoryLockService`]).
//! Expiring a session releases every lock it holds, which is what makes locks ephemeral.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use tokio::sync::{futures::Notified, Notify};
use tracing::{event, Level};

use super::error::{Error, Result};

pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Holder {
    session: SessionId,
    owner: String,
}

/// Result of a single [`LockTable::try_acquire`] attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryAcquire {
    Acquired,
    /// The lock is held by another session. `holder` is the identity it was acquired with
    Held { holder: String },
}

#[derive(Debug, Default)]
pub struct LockTable {
    holders: Mutex<HashMap<String, Holder>>,
    next_session: AtomicU64,
    released: Notify,
}

impl LockTable {
    fn acquire_lock(&self) -> MutexGuard<HashMap<String, Holder>> {
        // the map is never left half updated, so a poisoned mutex is still safe to use
        self.holders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn new_session(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Single non-blocking attempt to acquire `path` for `session`.
    /// Acquiring a lock already held by the same session succeeds.
    pub fn try_acquire(&self, path: &str, session: SessionId, owner: &str) -> TryAcquire {
        let mut guard = self.acquire_lock();
        match guard.get(path) {
            Some(holder) if holder.session != session => TryAcquire::Held {
                holder: holder.owner.clone(),
            },
            Some(_) => TryAcquire::Acquired,
            None => {
                guard.insert(
                    path.to_string(),
                    Holder {
                        session,
                        owner: owner.to_string(),
                    },
                );
                event!(Level::DEBUG, path, session, owner, "lock acquired");
                TryAcquire::Acquired
            }
        }
    }

    /// Releases `path` if it is held by `session`
    ///
    /// # Errors
    /// [`Error::NotHeld`] if `session` doesn't hold `path`
    pub fn release(&self, path: &str, session: SessionId) -> Result<()> {
        {
            let mut guard = self.acquire_lock();
            match guard.get(path) {
                Some(holder) if holder.session == session => {
                    guard.remove(path);
                }
                _ => {
                    return Err(Error::NotHeld {
                        path: path.to_string(),
                    });
                }
            }
        }

        event!(Level::DEBUG, path, session, "lock released");
        self.released.notify_waiters();
        Ok(())
    }

    /// Releases every lock held by `session` and returns their paths
    pub fn expire_session(&self, session: SessionId) -> Vec<String> {
        let expired: Vec<String> = {
            let mut guard = self.acquire_lock();
            let expired = guard
                .iter()
                .filter(|(_, holder)| holder.session == session)
                .map(|(path, _)| path.clone())
                .collect::<Vec<String>>();
            for path in expired.iter() {
                guard.remove(path);
            }
            expired
        };

        if !expired.is_empty() {
            event!(
                Level::INFO,
                session,
                n_locks = expired.len(),
                "session expired, locks released"
            );
            self.released.notify_waiters();
        }

        expired
    }

    /// Identity of the current holder of `path`
    pub fn holder(&self, path: &str) -> Option<String> {
        self.acquire_lock().get(path).map(|h| h.owner.clone())
    }

    /// Resolves the next time any lock is released
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::{LockTable, TryAcquire};
    use crate::lock::error::Error;

    #[test]
    fn acquire_is_exclusive_per_session() {
        let table = LockTable::default();
        let s1 = table.new_session();
        let s2 = table.new_session();
        assert_ne!(s1, s2);

        assert_eq!(table.try_acquire("/p/0", s1, "A"), TryAcquire::Acquired);
        assert_eq!(
            table.try_acquire("/p/0", s2, "B"),
            TryAcquire::Held {
                holder: "A".to_string()
            }
        );
        // re-entrant for the holder
        assert_eq!(table.try_acquire("/p/0", s1, "A"), TryAcquire::Acquired);
        assert_eq!(table.holder("/p/0"), Some("A".to_string()));
    }

    #[test]
    fn release_requires_holder_session() {
        let table = LockTable::default();
        let s1 = table.new_session();
        let s2 = table.new_session();
        table.try_acquire("/p/0", s1, "A");

        assert_eq!(
            table.release("/p/0", s2),
            Err(Error::NotHeld {
                path: "/p/0".to_string()
            })
        );
        table.release("/p/0", s1).unwrap();
        assert_eq!(table.holder("/p/0"), None);
        assert!(table.release("/p/0", s1).is_err());
    }

    #[test]
    fn expire_session_releases_only_its_locks() {
        let table = LockTable::default();
        let s1 = table.new_session();
        let s2 = table.new_session();
        table.try_acquire("/p/0", s1, "A");
        table.try_acquire("/p/1", s1, "A");
        table.try_acquire("/p/2", s2, "B");

        let mut expired = table.expire_session(s1);
        expired.sort();
        assert_eq!(expired, vec!["/p/0".to_string(), "/p/1".to_string()]);
        assert_eq!(table.holder("/p/0"), None);
        assert_eq!(table.holder("/p/2"), Some("B".to_string()));
        assert_eq!(table.try_acquire("/p/0", s2, "B"), TryAcquire::Acquired);
    }
}
