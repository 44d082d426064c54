//! Module that contains different partitioning schemes
use crate::cluster::error::Result;
use bytes::Bytes;

pub mod consistent_hashing;

/// This trait defines a PartitioningScheme (ie: which cluster node should own a given key)
///
/// For the 2 mutating operations: `add_node` and `remove_node`, ownership of some keys moves between nodes.
/// For partition ownership this means locks have to be released by one node and acquired by another,
/// so implementations should move as few keys as possible.
pub trait PartitioningScheme {
    /// adds a new node to the partition state
    fn add_node(&mut self, node: Bytes) -> Result<()>;

    /// removes a node from the partition state
    fn remove_node(&mut self, node: &[u8]) -> Result<()>;

    /// returns the owner of a given key
    fn key_owner(&self, key: &[u8]) -> Result<Bytes>;

    /// adds every node provided, stopping at the first error
    fn add_nodes(&mut self, nodes: &[Bytes]) -> Result<()> {
        for node in nodes {
            self.add_node(node.clone())?;
        }

        Ok(())
    }

    /// removes every node provided, stopping at the first error
    fn del_nodes(&mut self, nodes: &[Bytes]) -> Result<()> {
        for node in nodes {
            self.remove_node(node)?;
        }

        Ok(())
    }
}
