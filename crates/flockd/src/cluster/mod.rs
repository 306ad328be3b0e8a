//! Cluster driver adapter.
//!
//! The group-communication driver owns node discovery and the
//! totally-ordered broadcast channel; the daemon talks to it through the
//! [`ClusterDriver`] trait so the transport can be swapped without
//! touching the membership engine.
//!
//! Driver contract:
//! - every broadcast is observed in one total order by every node that
//!   observes it at all, the sender included (self-redelivery);
//! - view-changes and broadcasts interleave in a single global order seen
//!   identically by every connected node;
//! - a driver failure surfaces as an error from [`recv_event`], and the
//!   daemon exits nonzero.
//!
//! [`recv_event`]: ClusterDriver::recv_event

use async_trait::async_trait;

use flock_proto::error::SdResult;
use flock_proto::node::{NodeEntry, NodeId};

/// Events delivered from the cluster driver to the daemon.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// A node entered the transport group. `members` is the full view
    /// after the change, in delivery order.
    ViewJoin {
        joined: NodeId,
        members: Vec<NodeId>,
    },
    /// A node left the transport group. `members` is the view after the
    /// change.
    ViewLeave {
        left: NodeId,
        members: Vec<NodeId>,
    },
    /// A totally-ordered broadcast payload.
    Notify { from: NodeId, payload: Vec<u8> },
}

/// Trait that all cluster driver backends must implement.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    /// Human-readable name of this driver.
    fn name(&self) -> &str;

    /// Open the group and return this node's driver identity.
    async fn init(&self, entry: &NodeEntry) -> SdResult<NodeId>;

    /// Request admission to the transport group.
    async fn join(&self) -> SdResult<()>;

    /// Leave the transport group.
    async fn leave(&self) -> SdResult<()>;

    /// Totally-ordered broadcast to all current members, self included.
    async fn broadcast(&self, payload: &[u8]) -> SdResult<()>;

    /// Receive the next driver event. An error means the driver is gone
    /// and the node cannot continue.
    async fn recv_event(&self) -> SdResult<DriverEvent>;
}

pub mod local;
