//! Consistent-hash ring mapping user ids onto node identities.
//!
//! A user's home node is the ring successor of `hash(user_id)`. The hash is
//! an explicit FNV-1a so placement agrees across processes and
//! architectures; `DefaultHasher` is randomly keyed per process and cannot
//! be used here.

use std::collections::{BTreeMap, BTreeSet};

/// Identity of one node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Virtual nodes per physical node; smooths placement across few nodes.
pub const DEFAULT_VNODES: usize = 64;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Consistent-hash ring over the current node membership.
#[derive(Debug, Clone)]
pub struct HashRing {
    replicas: usize,
    vnodes: BTreeMap<u64, NodeId>,
    nodes: BTreeSet<NodeId>,
}

impl HashRing {
    /// Create an empty ring with the given virtual-node count.
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            vnodes: BTreeMap::new(),
            nodes: BTreeSet::new(),
        }
    }

    /// Add a node to the ring. Idempotent.
    pub fn insert(&mut self, node: NodeId) {
        if !self.nodes.insert(node.clone()) {
            return;
        }
        for i in 0..self.replicas {
            let key = fnv1a64(format!("{}:{}", node.as_str(), i).as_bytes());
            self.vnodes.insert(key, node.clone());
        }
    }

    /// Remove a node from the ring. Idempotent.
    pub fn remove(&mut self, node: &NodeId) {
        if !self.nodes.remove(node) {
            return;
        }
        self.vnodes.retain(|_, n| n != node);
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The home node for a key: the ring successor of its hash, wrapping
    /// around at the top.
    pub fn node_for(&self, key: &str) -> Option<&NodeId> {
        if self.vnodes.is_empty() {
            return None;
        }
        let hash = fnv1a64(key.as_bytes());
        self.vnodes
            .range(hash..)
            .next()
            .or_else(|| self.vnodes.iter().next())
            .map(|(_, node)| node)
    }
}
