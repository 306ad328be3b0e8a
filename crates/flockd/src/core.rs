//! In-memory membership state.
//!
//! One [`Core`] value holds everything a node knows about the cluster:
//! the rosters, the current epoch and status, and the VDI-in-use mirror.
//! Only the cluster worker mutates it; the I/O path sees it through
//! [`ClusterSnapshot`] values that may age by at most one event.
//!
//! Three rosters:
//! - *transport*: nodes the driver says are in the group, in arrival
//!   order, including ones whose join is still being ratified;
//! - *storage*: ratified members, kept sorted by the [`NodeEntry`] total
//!   order so that the head — the master — is the same on every node;
//! - *leave list*: nodes recorded in the latest epoch but currently
//!   absent, consulted by the rejoin quorum check.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitvec::prelude::*;

use flock_proto::constants::SD_NR_VDIS;
use flock_proto::error::{SdError, SdResult};
use flock_proto::node::{ClusterStatus, NodeEntry, NodeId};

use crate::ring::VnodeRing;

/// A node seen by the driver whose join has not been ratified yet. The
/// storage identity becomes known only once the node's join message
/// arrives.
#[derive(Debug, Clone)]
struct TransportMember {
    id: NodeId,
    entry: Option<NodeEntry>,
}

/// Read-only view published to I/O workers after every event.
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub epoch: u32,
    pub status: ClusterStatus,
    pub is_master: bool,
    pub nr_copies: u32,
    /// The ordered storage roster.
    pub nodes: Vec<NodeEntry>,
    pub ring: Arc<VnodeRing>,
}

/// The membership state of one node.
pub struct Core {
    pub this_id: NodeId,
    pub this_entry: NodeEntry,
    pub status: ClusterStatus,
    pub epoch: u32,
    /// Set once this node's own join has been ratified (or it became the
    /// first member of the group).
    pub join_finished: bool,
    pub ctime: u64,
    pub nr_copies: u32,
    transport: Vec<TransportMember>,
    storage: BTreeMap<NodeEntry, NodeId>,
    leave_list: BTreeMap<NodeEntry, NodeId>,
    vnode_cache: Option<Arc<VnodeRing>>,
    vdi_inuse: BitVec<u8, Msb0>,
}

impl Core {
    pub fn new(this_id: NodeId, this_entry: NodeEntry) -> Self {
        Self {
            this_id,
            this_entry,
            status: ClusterStatus::WaitForFormat,
            epoch: 0,
            join_finished: false,
            ctime: 0,
            nr_copies: 0,
            transport: Vec::new(),
            storage: BTreeMap::new(),
            leave_list: BTreeMap::new(),
            vnode_cache: None,
            vdi_inuse: bitvec![u8, Msb0; 0; SD_NR_VDIS as usize],
        }
    }

    // ─── Transport roster ───────────────────────────────────────────────

    pub fn transport_is_empty(&self) -> bool {
        self.transport.is_empty()
    }

    /// Record a node delivered by a driver view-change.
    pub fn add_transport(&mut self, id: NodeId) {
        if self.transport.iter().any(|m| m.id == id) {
            return;
        }
        self.transport.push(TransportMember { id, entry: None });
    }

    /// Bind the storage identity announced in a join message to the
    /// transport member it came from.
    pub fn bind_entry(&mut self, id: NodeId, entry: NodeEntry) -> bool {
        match self.transport.iter_mut().find(|m| m.id == id) {
            Some(m) => {
                m.entry = Some(entry);
                true
            }
            None => false,
        }
    }

    pub fn remove_transport_member(&mut self, id: NodeId) -> bool {
        let before = self.transport.len();
        self.transport.retain(|m| m.id != id);
        self.transport.len() != before
    }

    // ─── Storage roster ─────────────────────────────────────────────────

    /// Move a ratified node from the transport roster into the storage
    /// roster. Returns false when the node is not in the transport roster
    /// (it left meanwhile, or was already migrated).
    pub fn migrate_to_storage(&mut self, id: NodeId, entry: NodeEntry) -> bool {
        let pos = match self.transport.iter().position(|m| m.id == id) {
            Some(p) => p,
            None => return false,
        };
        self.transport.remove(pos);
        self.storage.insert(entry, id);
        self.vnode_cache = None;
        true
    }

    pub fn remove_storage_member(&mut self, id: NodeId) -> Option<NodeEntry> {
        let entry = self
            .storage
            .iter()
            .find(|(_, &member)| member == id)
            .map(|(&entry, _)| entry)?;
        self.storage.remove(&entry);
        self.vnode_cache = None;
        Some(entry)
    }

    pub fn nr_storage(&self) -> usize {
        self.storage.len()
    }

    pub fn storage_members(&self) -> impl Iterator<Item = (&NodeEntry, &NodeId)> {
        self.storage.iter()
    }

    pub fn storage_contains(&self, entry: &NodeEntry) -> bool {
        self.storage.contains_key(entry)
    }

    /// The ratified roster in its deterministic total order.
    pub fn ordered_node_list(&self) -> Vec<NodeEntry> {
        self.storage.keys().copied().collect()
    }

    /// Roster with driver identities, in roster order.
    pub fn node_pairs(&self) -> Vec<(NodeId, NodeEntry)> {
        self.storage.iter().map(|(&e, &id)| (id, e)).collect()
    }

    /// The storage-roster head. Mastership is a pure function of the
    /// roster, so no negotiation is ever needed.
    pub fn master(&self) -> Option<&NodeEntry> {
        self.storage.keys().next()
    }

    pub fn is_master(&self) -> bool {
        if !self.join_finished {
            return false;
        }
        self.master() == Some(&self.this_entry)
    }

    // ─── Leave list ─────────────────────────────────────────────────────

    pub fn nr_leave(&self) -> usize {
        self.leave_list.len()
    }

    pub fn leave_contains(&self, entry: &NodeEntry) -> bool {
        self.leave_list.contains_key(entry)
    }

    pub fn add_leave(&mut self, id: NodeId, entry: NodeEntry) {
        self.leave_list.entry(entry).or_insert(id);
    }

    pub fn leave_pairs(&self) -> Vec<(NodeId, NodeEntry)> {
        self.leave_list.iter().map(|(&e, &id)| (id, e)).collect()
    }

    pub fn clear_leave_list(&mut self) {
        self.leave_list.clear();
    }

    // ─── Placement ──────────────────────────────────────────────────────

    /// The vnode ring for the current roster, rebuilt lazily after any
    /// roster change.
    pub fn ring(&mut self) -> Arc<VnodeRing> {
        if self.vnode_cache.is_none() {
            self.vnode_cache = Some(Arc::new(VnodeRing::new(&self.ordered_node_list())));
        }
        self.vnode_cache.as_ref().cloned().unwrap_or_default()
    }

    pub fn ordered_vnode_list(&mut self) -> Vec<crate::ring::VNode> {
        self.ring().vnodes()
    }

    // ─── VDI-in-use mirror ──────────────────────────────────────────────

    pub fn set_vdi_inuse(&mut self, vid: u32) {
        if (vid as usize) < self.vdi_inuse.len() {
            self.vdi_inuse.set(vid as usize, true);
        }
    }

    pub fn clear_vdi_inuse(&mut self, vid: u32) {
        if (vid as usize) < self.vdi_inuse.len() {
            self.vdi_inuse.set(vid as usize, false);
        }
    }

    pub fn is_vdi_inuse(&self, vid: u32) -> bool {
        (vid as usize) < self.vdi_inuse.len() && self.vdi_inuse[vid as usize]
    }

    pub fn reset_vdi_inuse(&mut self) {
        self.vdi_inuse.fill(false);
    }

    // ─── Status ─────────────────────────────────────────────────────────

    /// Map the cluster status to the result a request must carry when the
    /// status gates it.
    pub fn status_result(&self) -> SdResult<()> {
        match self.status {
            ClusterStatus::Ok => Ok(()),
            ClusterStatus::WaitForFormat => Err(SdError::WaitForFormat),
            ClusterStatus::WaitForJoin => Err(SdError::WaitForJoin),
            ClusterStatus::Halt => Err(SdError::Halt),
            ClusterStatus::Shutdown => Err(SdError::Shutdown),
            ClusterStatus::JoinFailed => Err(SdError::JoinFailed),
        }
    }

    pub fn snapshot(&mut self) -> ClusterSnapshot {
        ClusterSnapshot {
            epoch: self.epoch,
            status: self.status,
            is_master: self.is_master(),
            nr_copies: self.nr_copies,
            nodes: self.ordered_node_list(),
            ring: self.ring(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn identity(n: u8) -> (NodeId, NodeEntry) {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, n));
        (NodeId::new(ip, n as u64), NodeEntry::new(ip, 7000))
    }

    #[test]
    fn test_rosters_migrate() {
        let (id1, ent1) = identity(1);
        let (id2, ent2) = identity(2);
        let mut core = Core::new(id1, ent1);

        core.add_transport(id1);
        core.add_transport(id2);
        core.add_transport(id2); // duplicate ignored
        assert!(!core.transport_is_empty());

        assert!(core.migrate_to_storage(id1, ent1));
        assert!(core.migrate_to_storage(id2, ent2));
        // Already migrated: the transport roster no longer has it
        assert!(!core.migrate_to_storage(id2, ent2));

        assert_eq!(core.ordered_node_list(), vec![ent1, ent2]);
        assert_eq!(core.nr_storage(), 2);
        assert!(core.transport_is_empty());
    }

    #[test]
    fn test_master_is_roster_head() {
        let (id1, ent1) = identity(1);
        let (id2, ent2) = identity(2);
        // This node sorts second, so it must not see itself as master.
        let mut core = Core::new(id2, ent2);
        core.join_finished = true;
        core.add_transport(id2);
        core.add_transport(id1);
        core.migrate_to_storage(id2, ent2);
        assert!(core.is_master());

        core.migrate_to_storage(id1, ent1);
        assert_eq!(core.master(), Some(&ent1));
        assert!(!core.is_master());

        // Master leaves; mastership moves without negotiation.
        assert_eq!(core.remove_storage_member(id1), Some(ent1));
        assert!(core.is_master());
    }

    #[test]
    fn test_master_requires_join_finished() {
        let (id1, ent1) = identity(1);
        let mut core = Core::new(id1, ent1);
        core.add_transport(id1);
        core.migrate_to_storage(id1, ent1);
        assert!(!core.is_master());
        core.join_finished = true;
        assert!(core.is_master());
    }

    #[test]
    fn test_remove_unknown_member() {
        let (id1, ent1) = identity(1);
        let (id9, _) = identity(9);
        let mut core = Core::new(id1, ent1);
        assert_eq!(core.remove_storage_member(id9), None);
        assert!(!core.remove_transport_member(id9));
    }

    #[test]
    fn test_leave_list_dedup() {
        let (id1, ent1) = identity(1);
        let (id3, ent3) = identity(3);
        let mut core = Core::new(id1, ent1);
        core.add_leave(id3, ent3);
        core.add_leave(id3, ent3);
        assert_eq!(core.nr_leave(), 1);
        assert!(core.leave_contains(&ent3));
        core.clear_leave_list();
        assert_eq!(core.nr_leave(), 0);
    }

    #[test]
    fn test_ring_cache_invalidation() {
        let (id1, ent1) = identity(1);
        let (id2, ent2) = identity(2);
        let mut core = Core::new(id1, ent1);
        core.add_transport(id1);
        core.migrate_to_storage(id1, ent1);

        let ring1 = core.ring();
        assert_eq!(ring1.nr_nodes(), 1);

        core.add_transport(id2);
        core.migrate_to_storage(id2, ent2);
        let ring2 = core.ring();
        assert_eq!(ring2.nr_nodes(), 2);
    }

    #[test]
    fn test_vdi_inuse_bits() {
        let (id1, ent1) = identity(1);
        let mut core = Core::new(id1, ent1);
        assert!(!core.is_vdi_inuse(42));
        core.set_vdi_inuse(42);
        assert!(core.is_vdi_inuse(42));
        core.set_vdi_inuse(42); // idempotent
        assert!(core.is_vdi_inuse(42));
        core.clear_vdi_inuse(42);
        assert!(!core.is_vdi_inuse(42));
        // Out-of-range ids are ignored, not a panic
        core.set_vdi_inuse(u32::MAX);
        assert!(!core.is_vdi_inuse(u32::MAX));
    }

    #[test]
    fn test_status_result() {
        let (id1, ent1) = identity(1);
        let mut core = Core::new(id1, ent1);
        assert_eq!(core.status_result(), Err(SdError::WaitForFormat));
        core.status = ClusterStatus::Ok;
        assert_eq!(core.status_result(), Ok(()));
        core.status = ClusterStatus::Halt;
        assert_eq!(core.status_result(), Err(SdError::Halt));
    }
}
