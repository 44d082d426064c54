//! Consistent-hashing is the default [`PartitioningScheme`] used to compute partition ownership
use crate::cluster::error::{Error, Result};
use bytes::Bytes;
use murmur3::murmur3_x86_128;
use std::io::Cursor;

use super::PartitioningScheme;

/// Let's force the usage of Hash functions that return u128 for now..
type HashFunctionReturnType = u128;

/// Number of positions each node occupies on the ring when nothing else is configured
pub const DEFAULT_VIRTUAL_NODES: usize = 100;

/// ConsistentHashing decides which cluster node should own a given key (for us, a partition number).
/// It does it by creating a fixed hash space - in this case from [0, 2^128)
/// and computing the hash of both the cluster nodes and the keys.
/// The node that owns the key is the first node whose hash is higher than (or equal to) the hash of the key.
/// Note that this hash space should be viewed as a circular buffer (or hash ring). Let's
/// try to understand the hash ring statement through an example:
///
/// In this example we have a hash space that goes from 0 to 10 (ie: the hash function returns a number between 0 and 10).
/// Nodes:     ['A', 'B', 'C']
/// Nodes_hash:[ 2 ,  5 ,  8 ]
///
/// partition '0', hash('0') = 4 -> owned by node B (hash 5)
/// partition '1', hash('1') = 7 -> owned by node C (hash 8)
/// partition '2', hash('2') = 9 -> owned by node A (hash 2)
///   - this last one shows the circular nature of the Nodes_hash, which is way
///    we sometimes refer this array as a 'hash ring'
///
/// **The important property of consistent hashing is that if a node is added/removed, only the keys
/// owned by that node change owner.** When one of N nodes leaves, roughly 1/N of the partitions move.
///
/// With a single position per node the ring is usually very unbalanced, so every node is placed
/// `virtual_nodes` times. Position 0 is the hash of the node itself, position i is the hash of `<node>#<i>`.
#[derive(Clone, Debug)]
pub struct ConsistentHashing {
    nodes: Vec<Bytes>,
    hashes: Vec<HashFunctionReturnType>,
    virtual_nodes: usize,
    hash_fn: fn(&[u8]) -> HashFunctionReturnType,
}

impl Default for ConsistentHashing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

impl ConsistentHashing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            nodes: Vec::new(),
            hashes: Vec::new(),
            virtual_nodes: virtual_nodes.max(1),
            hash_fn: murmur3_hash,
        }
    }

    /// Single position per node, hashed with the provided function
    pub fn new_with_hash_fn(hash_fn: fn(&[u8]) -> HashFunctionReturnType) -> Self {
        Self {
            nodes: Vec::new(),
            hashes: Vec::new(),
            virtual_nodes: 1,
            hash_fn,
        }
    }

    fn positions(&self, node: &[u8]) -> Vec<HashFunctionReturnType> {
        (0..self.virtual_nodes)
            .map(|i| {
                if i == 0 {
                    (self.hash_fn)(node)
                } else {
                    let mut key = node.to_vec();
                    key.extend_from_slice(format!("#{}", i).as_bytes());
                    (self.hash_fn)(&key)
                }
            })
            .collect()
    }

    fn key_owner_index(&self, key: &[u8]) -> Result<usize> {
        if self.nodes.is_empty() {
            return Err(Error::Logic {
                reason: "Can't ask for owner if no nodes are present".to_string(),
            });
        }

        let key_hash = (self.hash_fn)(key);
        Ok(self.hashes.partition_point(|elem| *elem < key_hash) % self.nodes.len())
    }
}

impl PartitioningScheme for ConsistentHashing {
    fn add_node(&mut self, node: Bytes) -> Result<()> {
        let mut positions = self.positions(&node);

        // nothing is inserted unless every position is free
        let n_positions = positions.len();
        positions.sort();
        positions.dedup();
        if positions.len() != n_positions
            || positions
                .iter()
                .any(|position| self.hashes.binary_search(position).is_ok())
        {
            return Err(Error::Internal { reason: "ConsistentHashing found a collision on its hash algorithm. This is currently an un-recoverable issue...".to_string() });
        }

        for position in positions {
            let index = self.hashes.partition_point(|elem| *elem < position);
            self.hashes.insert(index, position);
            self.nodes.insert(index, node.clone());
        }

        Ok(())
    }

    fn remove_node(&mut self, node: &[u8]) -> Result<()> {
        for position in self.positions(node) {
            if let Ok(index) = self.hashes.binary_search(&position) {
                if self.nodes[index] == node {
                    self.hashes.remove(index);
                    self.nodes.remove(index);
                }
            }
        }

        Ok(())
    }

    fn key_owner(&self, key: &[u8]) -> Result<Bytes> {
        let index = self.key_owner_index(key)?;
        Ok(self.nodes[index].clone())
    }
}

pub fn murmur3_hash(key: &[u8]) -> HashFunctionReturnType {
    murmur3_x86_128(&mut Cursor::new(key), 0).expect("reading from an in-memory cursor can't fail")
}

#[cfg(test)]
mod tests {
    use super::ConsistentHashing;
    use crate::cluster::partitioning::{
        consistent_hashing::{murmur3_hash, HashFunctionReturnType},
        PartitioningScheme,
    };
    use bytes::Bytes;
    use quickcheck::Arbitrary;
    use rand::{distributions::Alphanumeric, Rng};
    use std::{
        collections::{HashMap, HashSet},
        ops::Range,
    };

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
    struct TestNode {
        addr: Bytes,
    }

    #[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
    struct AddNodeTestInput {
        nodes: Vec<TestNode>,
    }

    fn generate_random_ascii_string(range_size: Range<usize>) -> String {
        let string_size = rand::thread_rng().gen_range(range_size);
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(string_size)
            .map(char::from)
            .collect()
    }

    fn generate_random_nodes(range: Range<usize>) -> Vec<TestNode> {
        let n_nodes = rand::thread_rng().gen_range(range);
        let mut nodes = Vec::with_capacity(n_nodes);
        for _ in 0..n_nodes {
            nodes.push(TestNode {
                addr: Bytes::from(generate_random_ascii_string(10..20)),
            })
        }
        nodes.sort();
        nodes.dedup();
        nodes
    }

    impl Arbitrary for AddNodeTestInput {
        fn arbitrary(_: &mut quickcheck::Gen) -> Self {
            Self {
                nodes: generate_random_nodes(1..50),
            }
        }
    }

    /// This test assets on the following invariants
    /// 1. All Nodes provided are properly added when `add_node` is called
    /// 2. the internal vector [`hashes`] contain all hashes from the provided nodes
    ///   and it is sorted
    /// 3. The internal vector [`nodes`] is synchronized with the [`hashes`] vector
    #[quickcheck]
    fn test_add_nodes_randomized(test_input: AddNodeTestInput) {
        let mut ring = ConsistentHashing::new(1);

        let node_hash_mapping: HashMap<HashFunctionReturnType, Bytes> = test_input
            .nodes
            .iter()
            .map(|elem| (murmur3_hash(&elem.addr), elem.addr.clone()))
            .collect();

        for node in test_input.nodes.iter() {
            ring.add_node(node.addr.clone()).unwrap();
        }

        let mut nodes_hashes: Vec<HashFunctionReturnType> = test_input
            .nodes
            .iter()
            .map(|e| murmur3_hash(&e.addr))
            .collect();
        nodes_hashes.sort();

        assert_eq!(ring.hashes.len(), test_input.nodes.len());
        assert_eq!(ring.hashes, nodes_hashes);
        assert_eq!(ring.nodes.len(), test_input.nodes.len());

        for i in 0..test_input.nodes.len() {
            assert_eq!(node_hash_mapping[&ring.hashes[i]], ring.nodes[i]);
        }
    }

    #[derive(Debug, Clone)]
    struct RemoveNodeTestInput {
        nodes: Vec<TestNode>,
        n_partitions: u32,
    }

    impl Arbitrary for RemoveNodeTestInput {
        fn arbitrary(_: &mut quickcheck::Gen) -> Self {
            Self {
                nodes: generate_random_nodes(2..10),
                n_partitions: rand::thread_rng().gen_range(1..200),
            }
        }
    }

    /// Removing a node must only move the partitions that node owned.
    /// Every other partition keeps its owner.
    #[quickcheck]
    fn test_remove_node_only_moves_its_partitions(test_input: RemoveNodeTestInput) {
        let mut ring = ConsistentHashing::default();
        for node in test_input.nodes.iter() {
            ring.add_node(node.addr.clone()).unwrap();
        }

        let before: Vec<Bytes> = (0..test_input.n_partitions)
            .map(|p| ring.key_owner(p.to_string().as_bytes()).unwrap())
            .collect();

        let removed = test_input.nodes[0].addr.clone();
        ring.remove_node(&removed).unwrap();

        for (p, previous_owner) in before.iter().enumerate() {
            let owner = ring.key_owner(p.to_string().as_bytes()).unwrap();
            assert_ne!(owner, removed);
            if *previous_owner != removed {
                assert_eq!(owner, *previous_owner);
            }
        }
    }

    #[test]
    fn test_virtual_nodes_balance_ownership() {
        let mut ring = ConsistentHashing::default();
        let nodes = vec![
            Bytes::from_static(b"node-a"),
            Bytes::from_static(b"node-b"),
            Bytes::from_static(b"node-c"),
        ];
        ring.add_nodes(&nodes).unwrap();
        assert_eq!(ring.hashes.len(), 3 * super::DEFAULT_VIRTUAL_NODES);

        let mut owned: HashMap<Bytes, usize> = HashMap::new();
        for p in 0..300u32 {
            *owned
                .entry(ring.key_owner(p.to_string().as_bytes()).unwrap())
                .or_default() += 1;
        }

        for node in nodes.iter() {
            let n = owned.get(node).copied().unwrap_or_default();
            assert!((40..=160).contains(&n), "{:?} owns {} partitions", node, n);
        }
    }

    #[test]
    fn test_del_nodes_removes_every_position() {
        let mut ring = ConsistentHashing::new(10);
        let nodes = vec![Bytes::from_static(b"node-a"), Bytes::from_static(b"node-b")];
        ring.add_nodes(&nodes).unwrap();
        ring.del_nodes(&nodes[1..]).unwrap();

        assert_eq!(ring.hashes.len(), 10);
        let remaining: HashSet<Bytes> = ring.nodes.iter().cloned().collect();
        assert_eq!(remaining, HashSet::from([nodes[0].clone()]));
    }

    #[test]
    fn test_adding_same_node_twice_is_a_collision() {
        let mut ring = ConsistentHashing::new(5);
        ring.add_node(Bytes::from_static(b"node-a")).unwrap();
        assert!(ring.add_node(Bytes::from_static(b"node-a")).is_err());
        assert_eq!(ring.hashes.len(), 5);
    }

    fn test_hash_fn(key: &[u8]) -> u128 {
        // this table precisely maps known keys to known hashes.
        // we will build test cases to cover all cases based on these known keys.
        let table: HashMap<Bytes, u128> = vec![
            (Bytes::from_static(b"Node A"), 10u128),
            (Bytes::from_static(b"Node B"), 20u128),
            (Bytes::from_static(b"Node C"), 30u128),
            (Bytes::from_static(b"Node D"), 40u128),
            (Bytes::from_static(b"key 1"), 1u128),
            (Bytes::from_static(b"key 2"), 5u128),
            (Bytes::from_static(b"key 3"), 10u128),
            (Bytes::from_static(b"key 4"), 11u128),
            (Bytes::from_static(b"key 5"), 19u128),
            (Bytes::from_static(b"key 6"), 20u128),
            (Bytes::from_static(b"key 7"), 21u128),
            (Bytes::from_static(b"key 8"), 28u128),
            (Bytes::from_static(b"key 9"), 30u128),
            (Bytes::from_static(b"key 10"), 31u128),
            (Bytes::from_static(b"key 11"), 39u128),
            (Bytes::from_static(b"key 12"), 40u128),
            (Bytes::from_static(b"key 13"), 41u128),
        ]
        .into_iter()
        .collect();

        table[&Bytes::copy_from_slice(key)]
    }

    fn test_nodes() -> Vec<Bytes> {
        vec![
            Bytes::from_static(b"Node A"),
            Bytes::from_static(b"Node B"),
            Bytes::from_static(b"Node C"),
            Bytes::from_static(b"Node D"),
        ]
    }

    fn test_keys() -> Vec<Bytes> {
        (1..=13)
            .map(|i| Bytes::from(format!("key {}", i)))
            .collect()
    }

    #[test]
    fn test_key_owner_table() {
        let nodes = test_nodes();
        let keys = test_keys();

        // owner index for each key, in order
        let expected_owners = [0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3, 0];

        let mut ring = ConsistentHashing::new_with_hash_fn(test_hash_fn);
        ring.add_nodes(&nodes).unwrap();

        for (key, owner) in keys.iter().zip(expected_owners) {
            assert_eq!(nodes[owner], ring.key_owner(key).unwrap());
        }
    }

    #[test]
    fn test_add_node() {
        let mut ring = ConsistentHashing::new_with_hash_fn(test_hash_fn);
        let nodes = test_nodes();
        ring.add_node(nodes[0].clone()).unwrap();

        // All keys must belong to this single node
        let keys = test_keys();
        for key in keys.iter() {
            assert_eq!(nodes[0], ring.key_owner(key).unwrap());
        }

        // By adding a node, only keys in (10, 20] change owner
        ring.add_node(nodes[1].clone()).unwrap();
        let expected_owners = [0, 0, 0, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0];
        for (key, owner) in keys.iter().zip(expected_owners) {
            assert_eq!(nodes[owner], ring.key_owner(key).unwrap());
        }
    }

    #[test]
    fn test_remove_node() {
        let mut ring = ConsistentHashing::new_with_hash_fn(test_hash_fn);
        let nodes = test_nodes();
        ring.add_nodes(&nodes[0..2]).unwrap();

        // now let's remove node A and make sure all keys belong to node B
        ring.remove_node(&nodes[0]).unwrap();
        for key in test_keys().iter() {
            assert_eq!(nodes[1], ring.key_owner(key).unwrap());
        }
    }

    #[test]
    fn test_key_owner_without_nodes() {
        let ring = ConsistentHashing::default();
        assert!(ring.key_owner(b"foo").is_err());
    }
}
