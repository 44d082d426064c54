//! Helpers used by tests and by the fault injection hooks of [`crate::lock::in_memory`]
use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use crate::partition::{OnChange, Partition};

pub mod fault;

/// Records every payload an [`OnChange`] callback receives
#[derive(Debug, Clone, Default)]
pub struct ChangeRecorder {
    payloads: Arc<Mutex<Vec<Vec<Partition>>>>,
}

impl ChangeRecorder {
    pub fn on_change(&self) -> OnChange {
        let payloads = self.payloads.clone();
        Box::new(move |current| {
            payloads
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(current)
        })
    }

    pub fn payloads(&self) -> Vec<Vec<Partition>> {
        self.payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn n_calls(&self) -> usize {
        self.payloads().len()
    }

    pub fn last(&self) -> Option<Vec<Partition>> {
        self.payloads().last().cloned()
    }
}

/// Polls `condition` until it returns true. Returns false if it didn't within `timeout`
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

/// Same as [`eventually`] for conditions that have to be awaited
pub async fn eventually_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

/// Deterministic ring positions for tests: node `"A"` sits at 100, `"B"` at 200, `"C"` at 300 and so on.
/// Partition keys (decimal strings) hash to `partition * 50`.
///
/// Meant to be used with [`crate::cluster::partitioning::consistent_hashing::ConsistentHashing::new_with_hash_fn`]
pub fn positional_hash(key: &[u8]) -> u128 {
    match key {
        [letter @ b'A'..=b'Z'] => (*letter - b'A' + 1) as u128 * 100,
        _ => std::str::from_utf8(key)
            .ok()
            .and_then(|s| s.parse::<u128>().ok())
            .map(|partition| partition * 50)
            .unwrap_or(u128::MAX),
    }
}
