//! In-process bus driver.
//!
//! All nodes of a test or single-process deployment attach to one
//! [`LocalBus`]. Broadcasts and view-changes are delivered to every
//! attached member under one bus lock, which is what gives the total
//! order the driver contract demands: every member's channel sees the
//! same sequence.
//!
//! The bus can also split itself into segments to emulate a network
//! partition, and crash a member abruptly to emulate driver loss.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use flock_proto::error::{SdError, SdResult};
use flock_proto::node::{NodeEntry, NodeId};

use super::{ClusterDriver, DriverEvent};

struct BusMember {
    id: NodeId,
    tx: mpsc::UnboundedSender<DriverEvent>,
    /// Partition segment; members only see events from their own segment.
    segment: usize,
}

#[derive(Default)]
struct BusInner {
    next_pid: u64,
    /// Initialized drivers, joined or not.
    registered: HashMap<NodeId, mpsc::UnboundedSender<DriverEvent>>,
    /// Joined members in attach order.
    members: Vec<BusMember>,
}

impl BusInner {
    fn segment_of(&self, id: NodeId) -> Option<usize> {
        self.members
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.segment)
    }

    fn segment_view(&self, segment: usize) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|m| m.segment == segment)
            .map(|m| m.id)
            .collect()
    }

    fn send_to_segment(&self, segment: usize, event: &DriverEvent) {
        for m in self.members.iter().filter(|m| m.segment == segment) {
            let _ = m.tx.send(event.clone());
        }
    }
}

/// Shared in-process event bus.
#[derive(Default)]
pub struct LocalBus {
    inner: Mutex<BusInner>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Split the joined members into segments. Each side observes the
    /// other side leaving, exactly as a partitioned network driver would
    /// report it.
    pub async fn partition(&self, groups: &[&[NodeId]]) {
        let mut inner = self.inner.lock().await;

        let mut assignment: HashMap<NodeId, usize> = HashMap::new();
        for (segment, group) in groups.iter().enumerate() {
            for &id in group.iter() {
                assignment.insert(id, segment);
            }
        }
        for m in inner.members.iter_mut() {
            if let Some(&segment) = assignment.get(&m.id) {
                m.segment = segment;
            }
        }

        // Every member sees each now-unreachable peer leave, in member
        // order, with the view shrinking as it goes.
        let snapshot: Vec<(NodeId, usize)> =
            inner.members.iter().map(|m| (m.id, m.segment)).collect();
        for &(left, left_segment) in &snapshot {
            for segment in 0..groups.len() {
                if segment == left_segment {
                    continue;
                }
                let members = inner.segment_view(segment);
                inner.send_to_segment(
                    segment,
                    &DriverEvent::ViewLeave {
                        left,
                        members,
                    },
                );
            }
        }
        info!("bus partitioned into {} segments", groups.len());
    }

    /// Deliver a broadcast as if `from` had sent it, without `from`
    /// having to be a member. Useful for replaying captured messages in
    /// tests.
    pub async fn inject(&self, from: NodeId, payload: &[u8]) {
        let inner = self.inner.lock().await;
        let segment = inner.segment_of(from).unwrap_or(0);
        inner.send_to_segment(
            segment,
            &DriverEvent::Notify {
                from,
                payload: payload.to_vec(),
            },
        );
    }

    /// Drop a member without a goodbye: remaining members in its segment
    /// observe a leave, the member's own event channel closes.
    pub async fn crash(&self, id: NodeId) {
        let mut inner = self.inner.lock().await;
        let segment = match inner.segment_of(id) {
            Some(s) => s,
            None => return,
        };
        inner.members.retain(|m| m.id != id);
        inner.registered.remove(&id);
        let members = inner.segment_view(segment);
        inner.send_to_segment(segment, &DriverEvent::ViewLeave { left: id, members });
    }
}

/// One node's handle onto a [`LocalBus`].
pub struct LocalDriver {
    bus: Arc<LocalBus>,
    state: Mutex<DriverState>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<DriverEvent>>>,
}

#[derive(Default)]
struct DriverState {
    id: Option<NodeId>,
    joined: bool,
}

impl LocalDriver {
    pub fn new(bus: Arc<LocalBus>) -> Self {
        Self {
            bus,
            state: Mutex::new(DriverState::default()),
            rx: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ClusterDriver for LocalDriver {
    fn name(&self) -> &str {
        "local"
    }

    async fn init(&self, entry: &NodeEntry) -> SdResult<NodeId> {
        let mut inner = self.bus.inner.lock().await;
        inner.next_pid += 1;
        let id = NodeId::new(entry.ip(), inner.next_pid);

        let (tx, rx) = mpsc::unbounded_channel();
        inner.registered.insert(id, tx);
        drop(inner);

        let mut state = self.state.lock().await;
        state.id = Some(id);
        *self.rx.lock().await = Some(rx);

        info!("local bus driver: init node {}", id);
        Ok(id)
    }

    async fn join(&self) -> SdResult<()> {
        let state = self.state.lock().await;
        let id = state.id.ok_or(SdError::ClusterError)?;
        if state.joined {
            debug!("local bus driver: duplicate join ignored");
            return Ok(());
        }
        drop(state);

        let mut inner = self.bus.inner.lock().await;
        let tx = inner
            .registered
            .get(&id)
            .cloned()
            .ok_or(SdError::ClusterError)?;
        inner.members.push(BusMember {
            id,
            tx,
            segment: 0,
        });
        let members = inner.segment_view(0);
        inner.send_to_segment(0, &DriverEvent::ViewJoin { joined: id, members });
        drop(inner);

        self.state.lock().await.joined = true;
        info!("local bus driver: node {} joined", id);
        Ok(())
    }

    async fn leave(&self) -> SdResult<()> {
        let mut state = self.state.lock().await;
        let id = state.id.ok_or(SdError::ClusterError)?;
        if !state.joined {
            return Err(SdError::ClusterError);
        }
        state.joined = false;
        drop(state);

        let mut inner = self.bus.inner.lock().await;
        let segment = inner.segment_of(id).ok_or(SdError::ClusterError)?;
        inner.members.retain(|m| m.id != id);
        let members = inner.segment_view(segment);
        inner.send_to_segment(segment, &DriverEvent::ViewLeave { left: id, members });
        Ok(())
    }

    async fn broadcast(&self, payload: &[u8]) -> SdResult<()> {
        let state = self.state.lock().await;
        let id = state.id.ok_or(SdError::ClusterError)?;
        if !state.joined {
            return Err(SdError::ClusterError);
        }
        drop(state);

        let inner = self.bus.inner.lock().await;
        let segment = inner.segment_of(id).ok_or(SdError::ClusterError)?;
        inner.send_to_segment(
            segment,
            &DriverEvent::Notify {
                from: id,
                payload: payload.to_vec(),
            },
        );
        Ok(())
    }

    async fn recv_event(&self) -> SdResult<DriverEvent> {
        let mut guard = self.rx.lock().await;
        let rx = guard.as_mut().ok_or(SdError::ClusterError)?;
        rx.recv().await.ok_or(SdError::ClusterError)
    }
}
