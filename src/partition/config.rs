use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::partitioning::consistent_hashing::DEFAULT_VIRTUAL_NODES;

fn default_connect_backoff_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_acquire_retry_interval_ms() -> u64 {
    1000
}

fn default_virtual_nodes() -> usize {
    DEFAULT_VIRTUAL_NODES
}

/// Configuration of a [`super::PartitionClient`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Namespaces the lock paths: `/lockpath/<app_name>/<partition>`
    pub app_name: String,
    /// Identity of the local node. Must be part of `cluster_list`
    pub self_name: String,
    pub cluster_list: Vec<String>,
    /// Partitions are `0..max_partition`
    pub max_partition: u32,
    pub lock_service: LockServiceConfig,
    #[serde(default = "default_acquire_retry_interval_ms")]
    pub acquire_retry_interval_ms: u64,
    /// Ring positions per node
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LockServiceConfig {
    pub addr: String,
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    /// How often an idle session is checked
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Config {
    pub fn new(
        app_name: &str,
        self_name: &str,
        cluster_list: &[&str],
        max_partition: u32,
        lock_service_addr: &str,
    ) -> Self {
        Self {
            app_name: app_name.to_string(),
            self_name: self_name.to_string(),
            cluster_list: cluster_list.iter().map(|n| n.to_string()).collect(),
            max_partition,
            lock_service: LockServiceConfig {
                addr: lock_service_addr.to_string(),
                connect_backoff_ms: default_connect_backoff_ms(),
                heartbeat_interval_ms: default_heartbeat_interval_ms(),
            },
            acquire_retry_interval_ms: default_acquire_retry_interval_ms(),
            virtual_nodes: default_virtual_nodes(),
        }
    }

    pub fn acquire_retry_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_retry_interval_ms)
    }
}

impl LockServiceConfig {
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
