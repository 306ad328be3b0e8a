/// Node identities and cluster status.
///
/// Two distinct identities exist for every node:
///
/// - [`NodeId`] is assigned by the group-communication driver and names one
///   node *instance* (address + process id). It is how view-change and
///   broadcast events refer to their subjects.
/// - [`NodeEntry`] is the storage-layer identity: the address/port clients
///   and peers use, plus replica-placement inputs (zone, vnode weight). It
///   is bound to a NodeId once the node's join has been ratified.
///
/// Both have fixed, version-stamped wire layouts; see `to_bytes`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::constants::{NODE_ENTRY_SIZE, NODE_ID_SIZE, SD_DEFAULT_VNODES, SD_LISTEN_PORT};
use crate::error::{SdError, SdResult};

/// Driver-level identity of one node instance.
///
/// Equality and total order are required for roster lookup and
/// tie-breaking; the order is (address, pid).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    /// Node address, IPv6 or IPv4-mapped, network byte order.
    pub addr: [u8; 16],
    /// Process identity within the driver group.
    pub pid: u64,
}

impl NodeId {
    pub fn new(addr: IpAddr, pid: u64) -> Self {
        Self {
            addr: addr_octets(addr),
            pid,
        }
    }

    pub fn ip(&self) -> IpAddr {
        octets_addr(&self.addr)
    }

    /// Fixed 24-byte little-endian wire layout: addr[16], pid u64.
    pub fn to_bytes(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.addr);
        buf.extend_from_slice(&self.pid.to_le_bytes());
    }

    pub fn from_bytes(buf: &[u8]) -> SdResult<Self> {
        if buf.len() < NODE_ID_SIZE {
            return Err(SdError::InvalidParms);
        }
        let mut addr = [0u8; 16];
        addr.copy_from_slice(&buf[..16]);
        let pid = u64::from_le_bytes(buf[16..24].try_into().unwrap_or_default());
        Ok(Self { addr, pid })
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip(), self.pid)
    }
}

/// Storage-layer identity of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Node address, IPv6 or IPv4-mapped, network byte order.
    pub addr: [u8; 16],
    /// Client/peer listen port.
    pub port: u16,
    /// Number of virtual nodes (placement weight).
    pub nr_vnodes: u16,
    /// Fault domain for replica diversity.
    pub zone: u32,
}

impl NodeEntry {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self {
            addr: addr_octets(addr),
            port,
            nr_vnodes: SD_DEFAULT_VNODES,
            zone: 0,
        }
    }

    pub fn ip(&self) -> IpAddr {
        octets_addr(&self.addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), self.port)
    }

    /// Derive the fault zone from the last four address bytes, used when
    /// no explicit zone was configured.
    pub fn derived_zone(&self) -> u32 {
        u32::from_le_bytes(self.addr[12..16].try_into().unwrap_or_default())
    }

    /// Fixed 24-byte little-endian wire layout:
    /// addr[16], port u16, nr_vnodes u16, zone u32.
    pub fn to_bytes(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.addr);
        buf.extend_from_slice(&self.port.to_le_bytes());
        buf.extend_from_slice(&self.nr_vnodes.to_le_bytes());
        buf.extend_from_slice(&self.zone.to_le_bytes());
    }

    pub fn from_bytes(buf: &[u8]) -> SdResult<Self> {
        if buf.len() < NODE_ENTRY_SIZE {
            return Err(SdError::InvalidParms);
        }
        let mut addr = [0u8; 16];
        addr.copy_from_slice(&buf[..16]);
        Ok(Self {
            addr,
            port: u16::from_le_bytes(buf[16..18].try_into().unwrap_or_default()),
            nr_vnodes: u16::from_le_bytes(buf[18..20].try_into().unwrap_or_default()),
            zone: u32::from_le_bytes(buf[20..24].try_into().unwrap_or_default()),
        })
    }
}

impl Default for NodeEntry {
    fn default() -> Self {
        Self {
            addr: addr_octets(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port: SD_LISTEN_PORT,
            nr_vnodes: SD_DEFAULT_VNODES,
            zone: 0,
        }
    }
}

impl fmt::Display for NodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port)
    }
}

impl PartialOrd for NodeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeEntry {
    /// The roster total order: (address, port). Every node sorts its
    /// storage roster with this, so the roster head — the master — is a
    /// pure function of membership.
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr
            .cmp(&other.addr)
            .then(self.port.cmp(&other.port))
    }
}

fn addr_octets(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

fn octets_addr(octets: &[u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(*octets);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

/// Cluster-wide serving state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStatus {
    /// No cluster has ever been formatted; waiting for an explicit format.
    WaitForFormat,
    /// A cluster existed before but not all known nodes have rejoined.
    WaitForJoin,
    /// Quorum achieved and serving.
    Ok,
    /// Serving administratively suspended.
    Halt,
    /// Terminal.
    Shutdown,
    /// The local node was rejected; it runs only as a stateless gateway.
    JoinFailed,
}

impl ClusterStatus {
    pub fn to_code(self) -> u32 {
        match self {
            Self::Ok => 1,
            Self::WaitForFormat => 2,
            Self::WaitForJoin => 3,
            Self::Shutdown => 4,
            Self::JoinFailed => 5,
            Self::Halt => 6,
        }
    }

    pub fn from_code(code: u32) -> SdResult<Self> {
        match code {
            1 => Ok(Self::Ok),
            2 => Ok(Self::WaitForFormat),
            3 => Ok(Self::WaitForJoin),
            4 => Ok(Self::Shutdown),
            5 => Ok(Self::JoinFailed),
            6 => Ok(Self::Halt),
            _ => Err(SdError::InvalidParms),
        }
    }

    /// Whether the cluster serves I/O and advances the epoch on
    /// membership changes.
    pub fn is_serving(self) -> bool {
        matches!(self, Self::Ok | Self::Halt)
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WaitForFormat => "wait-for-format",
            Self::WaitForJoin => "wait-for-join",
            Self::Ok => "ok",
            Self::Halt => "halt",
            Self::Shutdown => "shutdown",
            Self::JoinFailed => "join-failed",
        };
        f.write_str(s)
    }
}
