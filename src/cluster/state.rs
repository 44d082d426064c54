//! This file contains the [`ClusterState`] data structure.
//! It holds the local view of cluster membership and owns the [`PartitioningScheme`] provided during construction,
//! delegating queries like: Which node is the target owner of a given partition to it.
//!
//! Membership is replaced wholesale by the caller (see [`ClusterState::update`]) but the partitioning scheme
//! is only updated incrementally, adding the nodes that joined and removing the ones that left.
//! This is what keeps partitions whose owner didn't change where they are.
use bytes::Bytes;
use std::collections::BTreeSet;
use tracing::{event, Level};

use super::{
    error::{Error, Result},
    partitioning::PartitioningScheme,
};

/// The nodes that joined and left the cluster as a result of [`ClusterState::update`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl MembershipChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct ClusterState {
    own_node: String,
    // Which nodes are part of the ring
    nodes: BTreeSet<String>,
    partitioning_scheme: Box<dyn PartitioningScheme + Send>,
}

impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterState")
            .field("own_node", &self.own_node)
            .field("nodes", &self.nodes)
            .finish()
    }
}

impl ClusterState {
    /// Builds the initial ring from `cluster_list`.
    ///
    /// # Errors
    /// [`Error::OwnNodeNotInCluster`] if `own_node` is not part of `cluster_list`
    pub fn new(
        mut partitioning_scheme: Box<dyn PartitioningScheme + Send>,
        own_node: String,
        cluster_list: &[String],
    ) -> Result<Self> {
        let nodes: BTreeSet<String> = cluster_list.iter().cloned().collect();
        if !nodes.contains(&own_node) {
            return Err(Error::OwnNodeNotInCluster { own_node });
        }

        let ring_nodes: Vec<Bytes> = nodes.iter().cloned().map(Bytes::from).collect();
        partitioning_scheme.add_nodes(&ring_nodes)?;

        Ok(Self {
            own_node,
            nodes,
            partitioning_scheme,
        })
    }

    /// Replaces the cluster membership with `cluster_list`.
    ///
    /// Nodes that joined are added to the partitioning scheme first, then the ones that left are removed.
    /// The update is all-or-nothing: if the list doesn't include the own node, or the partitioning scheme
    /// rejects a node, the previous membership is left untouched.
    pub fn update(&mut self, cluster_list: &[String]) -> Result<MembershipChange> {
        let new_nodes: BTreeSet<String> = cluster_list.iter().cloned().collect();
        if !new_nodes.contains(&self.own_node) {
            return Err(Error::OwnNodeNotInCluster {
                own_node: self.own_node.clone(),
            });
        }

        let change = MembershipChange {
            added: new_nodes.difference(&self.nodes).cloned().collect(),
            removed: self.nodes.difference(&new_nodes).cloned().collect(),
        };

        if change.is_empty() {
            return Ok(change);
        }

        let mut added = Vec::with_capacity(change.added.len());
        for node in change.added.iter() {
            let node = Bytes::from(node.clone());
            if let Err(err) = self.partitioning_scheme.add_node(node.clone()) {
                if let Err(rollback_err) = self.partitioning_scheme.del_nodes(&added) {
                    event!(
                        Level::ERROR,
                        "Unable to roll back ring update: {}",
                        rollback_err
                    );
                }
                return Err(err);
            }
            added.push(node);
        }

        let removed: Vec<Bytes> = change.removed.iter().cloned().map(Bytes::from).collect();
        self.partitioning_scheme.del_nodes(&removed)?;
        self.nodes = new_nodes;

        event!(
            Level::INFO,
            added = ?change.added,
            removed = ?change.removed,
            "cluster membership updated"
        );

        Ok(change)
    }

    pub fn key_owner(&self, key: &[u8]) -> Result<Bytes> {
        self.partitioning_scheme.key_owner(key)
    }

    pub fn owns_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.key_owner(key)? == self.own_node.as_bytes())
    }

    pub fn nodes(&self) -> Vec<String> {
        self.nodes.iter().cloned().collect()
    }
}
