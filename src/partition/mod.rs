//! Partition ownership.
//!
//! A [`PartitionClient`] splits the partition space `0..max_partition` between the nodes of a cluster.
//! The consistent hashing ring decides which partitions a node *should* own (the target set).
//! Ownership is only *confirmed* once the node holds the partition lock on the [`LockService`]
//! (the current set). Every time the target set changes the client reconciles:
//!  - partitions that joined the target set get an acquisition task that retries a non-blocking acquire
//!    at a fixed interval until it succeeds or is cancelled;
//!  - in-flight acquisitions for partitions that left the target set are cancelled and joined;
//!  - owned partitions that left the target set are removed from the current set (and reported) before
//!    their locks are released.
//!
//! The `on_change` callback receives a sorted copy of the current set once per acquired partition and once
//! per reconciliation for all the partitions that were given up.
//!
//! If the lock service reports the session [`ConnectionState::Down`], every lock is gone: the current set is
//! cleared (one callback) and the client enters the failed state.
//!
//! # Callback constraints
//! `on_change` runs while the ownership mutex is held. It must not call back into the [`PartitionClient`].
pub mod config;

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    sync::{watch, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

use crate::{
    cluster::{
        partitioning::{consistent_hashing::ConsistentHashing, PartitioningScheme},
        state::ClusterState,
    },
    error::{Error, Result},
    lock::{
        connection::ConnectionState, lock_path, remote::RemoteLockService, Acquire, Lock,
        LockService,
    },
};

use self::config::Config;

pub type Partition = u32;

/// Called with a sorted copy of the current ownership set every time it changes
pub type OnChange = Box<dyn Fn(Vec<Partition>) + Send + Sync>;

const OWNED_PARTITIONS_GAUGE: &str = "partman_owned_partitions";
const PARTITION_ACQUIRED_COUNTER: &str = "partman_partition_acquired_total";
const PARTITION_RELEASED_COUNTER: &str = "partman_partition_released_total";

#[derive(Debug, Default)]
struct OwnershipState {
    current: BTreeSet<Partition>,
    closed: bool,
}

/// Everything acquisition tasks need
struct Shared {
    app_name: String,
    retry_interval: Duration,
    /// one lock per partition, indexed by partition
    locks: Vec<Arc<dyn Lock>>,
    state: Mutex<OwnershipState>,
    on_change: OnChange,
    fatal: watch::Sender<Option<Error>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<OwnershipState> {
        // the sets are never left half updated, so a poisoned mutex is still safe to use
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self, partition: Partition) -> Result<&Arc<dyn Lock>> {
        self.locks
            .get(partition as usize)
            .ok_or_else(|| Error::Internal {
                reason: format!("no lock for partition {}", partition),
            })
    }

    fn fatal_error(&self) -> Option<Error> {
        self.fatal.borrow().clone()
    }

    fn notify(&self, state: &OwnershipState) {
        metrics::gauge!(OWNED_PARTITIONS_GAUGE, "app" => self.app_name.clone())
            .set(state.current.len() as f64);
        (self.on_change)(state.current.iter().copied().collect());
    }

    /// Adds `partition` to the current set unless its acquisition was cancelled in the meantime.
    /// Returns false if the lock has to be given back
    fn gain(&self, partition: Partition, token: &CancellationToken) -> bool {
        let mut state = self.state();
        if token.is_cancelled() || state.closed {
            return false;
        }

        state.current.insert(partition);
        event!(
            Level::INFO,
            app = %self.app_name,
            partition,
            "partition acquired"
        );
        metrics::counter!(PARTITION_ACQUIRED_COUNTER, "app" => self.app_name.clone()).increment(1);
        self.notify(&state);
        true
    }

    /// Removes every partition outside of `target` from the current set, with a single callback
    fn give_up(&self, target: &BTreeSet<Partition>) -> Vec<Partition> {
        let mut state = self.state();
        let lost: Vec<Partition> = state.current.difference(target).copied().collect();
        if lost.is_empty() {
            return lost;
        }

        for partition in lost.iter() {
            state.current.remove(partition);
        }
        event!(
            Level::INFO,
            app = %self.app_name,
            partitions = ?lost,
            "partitions given up"
        );
        metrics::counter!(PARTITION_RELEASED_COUNTER, "app" => self.app_name.clone())
            .increment(lost.len() as u64);
        self.notify(&state);
        lost
    }

    fn escalate(&self, partition: Partition, err: crate::lock::error::Error) {
        event!(
            Level::ERROR,
            app = %self.app_name,
            partition,
            "unexpected lock service error while acquiring partition: {}",
            err
        );
        self.fail(format!("acquiring partition {} failed: {}", partition, err));
    }

    /// Stores the first fatal error, later ones are dropped
    fn fail(&self, reason: String) {
        self.fatal.send_if_modified(|fatal| {
            if fatal.is_some() {
                return false;
            }
            *fatal = Some(Error::Fatal { reason });
            true
        });
    }

    /// The lock service session is gone and every lock with it. Ownership is dropped with a single
    /// callback and the client enters the failed state. Ignored once the client is closed
    fn lose_session(&self, addr: &str) {
        let mut state = self.state();
        if state.closed {
            return;
        }

        event!(
            Level::ERROR,
            app = %self.app_name,
            addr,
            partitions = ?state.current,
            "lock service session lost"
        );
        self.fail(format!("lock service session to {} lost", addr));
        if !state.current.is_empty() {
            let n_lost = state.current.len();
            state.current.clear();
            metrics::counter!(PARTITION_RELEASED_COUNTER, "app" => self.app_name.clone())
                .increment(n_lost as u64);
            self.notify(&state);
        }
    }
}

/// Puts the client in the failed state as soon as the lock service reports the session down
async fn watch_session(
    shared: Arc<Shared>,
    addr: String,
    mut state: watch::Receiver<ConnectionState>,
    token: CancellationToken,
) {
    loop {
        if *state.borrow_and_update() == ConnectionState::Down {
            shared.lose_session(&addr);
            return;
        }

        tokio::select! {
            _ = token.cancelled() => return,
            changed = state.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

async fn release(lock: &dyn Lock, partition: Partition) {
    if let Err(err) = lock.release().await {
        event!(
            Level::WARN,
            partition,
            path = %lock.path(),
            "Unable to release partition lock: {}",
            err
        );
    }
}

/// Acquisition task of a single partition. Retries until the lock is acquired or `token` is cancelled.
/// Any lock service error stops the task and puts the client in the failed state
async fn acquire_partition(shared: Arc<Shared>, partition: Partition, token: CancellationToken) {
    let lock = match shared.lock(partition) {
        Ok(lock) => lock.clone(),
        Err(err) => {
            event!(Level::ERROR, partition, "{}", err);
            return;
        }
    };

    let mut n_attempts: usize = 0;
    loop {
        if token.is_cancelled() {
            return;
        }

        n_attempts += 1;
        match lock.acquire(false).await {
            Ok(Acquire::Acquired) => {
                if !shared.gain(partition, &token) {
                    release(lock.as_ref(), partition).await;
                }
                return;
            }
            Ok(Acquire::NotAcquired) => {
                event!(Level::DEBUG, partition, n_attempts, "partition lock is held, retrying");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(shared.retry_interval) => {}
                }
            }
            Ok(Acquire::Cancelled) => return,
            Err(err) => {
                shared.escalate(partition, err);
                return;
            }
        }
    }
}

struct PendingAcquisition {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

/// State only touched by reconciliation passes, which are serialized by the mutex around it
struct Reconciler {
    cluster: ClusterState,
    target: BTreeSet<Partition>,
    pending: HashMap<Partition, PendingAcquisition>,
}

pub struct PartitionClient {
    shared: Arc<Shared>,
    lock_service: Arc<dyn LockService>,
    reconciler: AsyncMutex<Reconciler>,
    max_partition: Partition,
    /// parent of every acquisition task token
    tasks: CancellationToken,
}

impl std::fmt::Debug for PartitionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionClient")
            .field("app_name", &self.shared.app_name)
            .field("max_partition", &self.max_partition)
            .field("lock_service", &self.lock_service)
            .finish()
    }
}

impl PartitionClient {
    /// Creates a client that talks to the lock server at `config.lock_service.addr`.
    ///
    /// Only returns once the lock service is reachable. Acquisitions proceed in the background.
    pub async fn new(config: Config, on_change: OnChange) -> Result<Self> {
        let lock_service = Arc::new(RemoteLockService::new(
            config.lock_service.addr.clone(),
            config.lock_service.connect_backoff(),
            config.lock_service.heartbeat_interval(),
        ));
        Self::with_lock_service(config, on_change, lock_service).await
    }

    pub async fn with_lock_service(
        config: Config,
        on_change: OnChange,
        lock_service: Arc<dyn LockService>,
    ) -> Result<Self> {
        let ring = Box::new(ConsistentHashing::new(config.virtual_nodes));
        Self::with_partitioning_scheme(config, on_change, lock_service, ring).await
    }

    /// # Errors
    /// [`Error::Configuration`] if `config.self_name` is not part of `config.cluster_list`
    #[instrument(name = "partition::client::new", level = "info", skip_all, fields(app = %config.app_name, node = %config.self_name))]
    pub async fn with_partitioning_scheme(
        config: Config,
        on_change: OnChange,
        lock_service: Arc<dyn LockService>,
        partitioning_scheme: Box<dyn PartitioningScheme + Send>,
    ) -> Result<Self> {
        let cluster = ClusterState::new(
            partitioning_scheme,
            config.self_name.clone(),
            &config.cluster_list,
        )?;

        lock_service.connect().await?;

        let locks = (0..config.max_partition)
            .map(|partition| {
                lock_service.lock(
                    lock_path(&config.app_name, partition),
                    config.self_name.clone(),
                )
            })
            .collect();

        let (fatal, _) = watch::channel(None);
        let client = Self {
            shared: Arc::new(Shared {
                app_name: config.app_name.clone(),
                retry_interval: config.acquire_retry_interval(),
                locks,
                state: Default::default(),
                on_change,
                fatal,
            }),
            lock_service,
            reconciler: AsyncMutex::new(Reconciler {
                cluster,
                target: BTreeSet::new(),
                pending: HashMap::new(),
            }),
            max_partition: config.max_partition,
            tasks: CancellationToken::new(),
        };

        tokio::spawn(watch_session(
            client.shared.clone(),
            client.lock_service.addr().to_string(),
            client.lock_service.connection_state(),
            client.tasks.child_token(),
        ));

        {
            let mut reconciler = client.reconciler.lock().await;
            reconciler.target = client.target(&reconciler.cluster)?;
            client.reconcile(&mut reconciler).await;
        }

        Ok(client)
    }

    /// Replaces the cluster membership and reconciles ownership with the new target set.
    /// Calling it again with the same membership is a noop.
    ///
    /// # Errors
    ///  - [`Error::Configuration`] if the local node is not part of `cluster_list`. Nothing changes in that case
    ///  - [`Error::Fatal`] once an acquisition failed with an unexpected lock service error
    ///  - [`Error::Closed`] after [`PartitionClient::close`]
    pub async fn update_cluster_list(&self, cluster_list: Vec<String>) -> Result<()> {
        let mut reconciler = self.reconciler.lock().await;
        self.check_healthy()?;

        let change = reconciler.cluster.update(&cluster_list)?;
        if change.is_empty() {
            return Ok(());
        }

        reconciler.target = self.target(&reconciler.cluster)?;
        self.reconcile(&mut reconciler).await;
        Ok(())
    }

    /// Whether the local node currently holds the lock of `partition`
    pub fn own_partition(&self, partition: Partition) -> bool {
        self.shared.state().current.contains(&partition)
    }

    /// Resolves once the client entered the failed state, with the [`Error::Fatal`] that caused it
    pub async fn fatal_error(&self) -> Error {
        let mut rx = self.shared.fatal.subscribe();
        loop {
            let fatal = rx.borrow_and_update().clone();
            if let Some(err) = fatal {
                return err;
            }
            if rx.changed().await.is_err() {
                return Error::Closed;
            }
        }
    }

    /// Cancels every acquisition, forgets the current set (without calling `on_change`) and closes the
    /// lock service session, which releases the locks still held. Calling it more than once is a noop.
    pub async fn close(&self) {
        let mut reconciler = self.reconciler.lock().await;
        {
            let mut state = self.shared.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.current.clear();
        }
        metrics::gauge!(OWNED_PARTITIONS_GAUGE, "app" => self.shared.app_name.clone()).set(0.0);

        let pending: Vec<(Partition, PendingAcquisition)> = reconciler.pending.drain().collect();
        self.cancel_and_join(pending).await;

        if let Err(err) = self.lock_service.close().await {
            event!(Level::WARN, "Unable to close lock service session: {}", err);
        }
        self.tasks.cancel();
        event!(Level::INFO, app = %self.shared.app_name, "partition client closed");
    }

    fn check_healthy(&self) -> Result<()> {
        if let Some(err) = self.shared.fatal_error() {
            return Err(err);
        }
        if self.shared.state().closed {
            return Err(Error::Closed);
        }

        Ok(())
    }

    fn target(&self, cluster: &ClusterState) -> Result<BTreeSet<Partition>> {
        let mut target = BTreeSet::new();
        for partition in 0..self.max_partition {
            if cluster.owns_key(partition.to_string().as_bytes())? {
                target.insert(partition);
            }
        }

        Ok(target)
    }

    async fn cancel_and_join(&self, pending: Vec<(Partition, PendingAcquisition)>) {
        let mut handles = Vec::with_capacity(pending.len());
        for (partition, acquisition) in pending {
            if let Ok(lock) = self.shared.lock(partition) {
                lock.cancel().await;
            }
            acquisition.token.cancel();
            handles.push(acquisition.handle);
        }

        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                event!(Level::ERROR, "acquisition task failed: {}", err);
            }
        }
    }

    /// Health is checked by the callers before the membership changes, so a failure in between doesn't
    /// leave a membership change half applied
    #[instrument(level = "debug", skip_all, fields(app = %self.shared.app_name))]
    async fn reconcile(&self, reconciler: &mut Reconciler) {
        // finished tasks either confirmed ownership or died, either way they don't count as pending anymore
        reconciler
            .pending
            .retain(|_, acquisition| !acquisition.handle.is_finished());

        let stale: Vec<Partition> = reconciler
            .pending
            .keys()
            .filter(|partition| !reconciler.target.contains(*partition))
            .copied()
            .collect();
        let stale: Vec<(Partition, PendingAcquisition)> = stale
            .into_iter()
            .filter_map(|partition| {
                reconciler
                    .pending
                    .remove(&partition)
                    .map(|acquisition| (partition, acquisition))
            })
            .collect();
        self.cancel_and_join(stale).await;

        for partition in self.shared.give_up(&reconciler.target) {
            match self.shared.lock(partition) {
                Ok(lock) => release(lock.as_ref(), partition).await,
                Err(err) => event!(Level::ERROR, partition, "{}", err),
            }
        }

        let current = self.shared.state().current.clone();
        for partition in reconciler.target.iter().copied() {
            if current.contains(&partition) || reconciler.pending.contains_key(&partition) {
                continue;
            }

            let token = self.tasks.child_token();
            let handle = tokio::spawn(acquire_partition(
                self.shared.clone(),
                partition,
                token.clone(),
            ));
            reconciler
                .pending
                .insert(partition, PendingAcquisition { handle, token });
        }

        event!(
            Level::DEBUG,
            target = reconciler.target.len(),
            current = current.len(),
            pending = reconciler.pending.len(),
            "reconciliation done"
        );
    }
}

impl Drop for PartitionClient {
    fn drop(&mut self) {
        self.tasks.cancel();
    }
}
