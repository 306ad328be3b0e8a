//! Virtual-node ring derived from the storage roster.
//!
//! Each physical node contributes `nr_vnodes` points on a 64-bit hash
//! ring; replicas of an object live on the first distinct nodes found
//! walking the ring from the object's hash, preferring distinct fault
//! zones. Every node derives the ring from the same ordered roster, so
//! placement is identical cluster-wide.

use std::collections::{BTreeMap, HashSet};

use flock_proto::hash::{sd_hash, sd_hash_next, sd_hash_oid};
use flock_proto::node::NodeEntry;

/// One virtual node: a ring position owned by a physical node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VNode {
    pub hash: u64,
    pub node: NodeEntry,
}

/// Immutable snapshot of the ring for one membership epoch.
#[derive(Debug, Clone, Default)]
pub struct VnodeRing {
    vnodes: BTreeMap<u64, NodeEntry>,
    nr_nodes: usize,
    nr_zones: usize,
}

impl VnodeRing {
    pub fn new(nodes: &[NodeEntry]) -> Self {
        let mut vnodes = BTreeMap::new();
        let mut zones = HashSet::new();

        for node in nodes {
            zones.insert(node.zone);
            let mut seed = Vec::with_capacity(24);
            node.to_bytes(&mut seed);
            let mut hash = sd_hash(&seed);
            for _ in 0..node.nr_vnodes {
                vnodes.insert(hash, *node);
                hash = sd_hash_next(hash);
            }
        }

        Self {
            vnodes,
            nr_nodes: nodes.len(),
            nr_zones: zones.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vnodes.is_empty()
    }

    pub fn nr_nodes(&self) -> usize {
        self.nr_nodes
    }

    pub fn nr_zones(&self) -> usize {
        self.nr_zones
    }

    /// Ordered list of (hash, owner) ring points.
    pub fn vnodes(&self) -> Vec<VNode> {
        self.vnodes
            .iter()
            .map(|(&hash, &node)| VNode { hash, node })
            .collect()
    }

    /// The nodes responsible for `oid`, zone-diverse where possible.
    pub fn oid_to_nodes(&self, oid: u64, nr_copies: usize) -> Vec<NodeEntry> {
        if self.vnodes.is_empty() || nr_copies == 0 {
            return Vec::new();
        }

        let hash = sd_hash_oid(oid);
        let mut result: Vec<NodeEntry> = Vec::with_capacity(nr_copies);
        let mut zones_used = HashSet::new();

        let walk = self
            .vnodes
            .range(hash..)
            .chain(self.vnodes.iter())
            .map(|(_, node)| node);
        for node in walk {
            if result.len() >= nr_copies {
                break;
            }
            if result.contains(node) {
                continue;
            }
            if zones_used.len() < self.nr_zones && zones_used.contains(&node.zone) {
                continue;
            }
            zones_used.insert(node.zone);
            result.push(*node);
        }

        // Not enough distinct zones; fill the remaining slots with any
        // distinct nodes.
        if result.len() < nr_copies {
            let walk = self
                .vnodes
                .range(hash..)
                .chain(self.vnodes.iter())
                .map(|(_, node)| node);
            for node in walk {
                if result.len() >= nr_copies {
                    break;
                }
                if !result.contains(node) {
                    result.push(*node);
                }
            }
        }

        result
    }

    /// Whether `entry` holds a replica of `oid`.
    pub fn is_access_local(&self, entry: &NodeEntry, oid: u64, nr_copies: usize) -> bool {
        if oid == 0 {
            return false;
        }
        self.oid_to_nodes(oid, nr_copies).iter().any(|n| n == entry)
    }
}
