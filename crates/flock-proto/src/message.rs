/// Cluster broadcast envelope and payloads.
///
/// Every message on the totally-ordered bus carries a fixed little-endian
/// header followed by an opcode-specific payload. The `state` field drives
/// the two-phase request/response pattern over the same ordered channel:
/// the originator broadcasts `INIT`, the current master fills in a response
/// and rebroadcasts the same message with `FIN`, and every node — the
/// originator included — applies the `FIN` deterministically.
///
/// Header layout (56 bytes):
/// `proto_ver:u8, pad:u8, op:u8, state:u8, msg_length:u32,
///  from_id:NodeId, from_entry:NodeEntry`.

use crate::constants::{
    MSG_HEADER_SIZE, NODE_ENTRY_SIZE, NODE_ID_SIZE, SD_MAX_NODES, SD_NODE_PROTO_VER,
};
use crate::error::{SdError, SdResult};
use crate::node::{ClusterStatus, NodeEntry, NodeId};

/// Broadcast opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Join = 1,
    VdiOp = 2,
    MasterChanged = 3,
    Leave = 4,
    MasterTransfer = 5,
}

impl Opcode {
    pub fn from_u8(v: u8) -> SdResult<Self> {
        match v {
            1 => Ok(Self::Join),
            2 => Ok(Self::VdiOp),
            3 => Ok(Self::MasterChanged),
            4 => Ok(Self::Leave),
            5 => Ok(Self::MasterTransfer),
            _ => Err(SdError::InvalidParms),
        }
    }
}

/// Message delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgState {
    Init = 1,
    Cont = 2,
    Fin = 3,
}

impl MsgState {
    pub fn from_u8(v: u8) -> SdResult<Self> {
        match v {
            1 => Ok(Self::Init),
            2 => Ok(Self::Cont),
            3 => Ok(Self::Fin),
            _ => Err(SdError::InvalidParms),
        }
    }
}

/// Fixed header carried by every broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub proto_ver: u8,
    pub op: Opcode,
    pub state: MsgState,
    /// Total message length including this header; filled in by `encode`.
    pub msg_length: u32,
    /// Driver identity of the originator.
    pub from_id: NodeId,
    /// Storage identity of the originator.
    pub from_entry: NodeEntry,
}

impl MessageHeader {
    pub fn new(op: Opcode, state: MsgState, from_id: NodeId, from_entry: NodeEntry) -> Self {
        Self {
            proto_ver: SD_NODE_PROTO_VER,
            op,
            state,
            msg_length: 0,
            from_id,
            from_entry,
        }
    }

    fn to_bytes(&self, buf: &mut Vec<u8>) {
        buf.push(self.proto_ver);
        buf.push(0); // pad
        buf.push(self.op as u8);
        buf.push(self.state as u8);
        buf.extend_from_slice(&self.msg_length.to_le_bytes());
        self.from_id.to_bytes(buf);
        self.from_entry.to_bytes(buf);
    }

    fn from_reader(r: &mut Reader<'_>) -> SdResult<Self> {
        let proto_ver = r.u8()?;
        let _pad = r.u8()?;
        let op = Opcode::from_u8(r.u8()?)?;
        let state = MsgState::from_u8(r.u8()?)?;
        let msg_length = r.u32()?;
        let from_id = r.node_id()?;
        let from_entry = r.node_entry()?;
        Ok(Self {
            proto_ver,
            op,
            state,
            msg_length,
            from_id,
            from_entry,
        })
    }
}

/// Join request/response. The same message is broadcast twice: the joiner
/// sends `INIT` filled with its locally-known epoch state, the master
/// rewrites the outcome fields and rebroadcasts `FIN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinMessage {
    pub header: MessageHeader,
    /// Replication factor: the joiner's known value on INIT, the
    /// cluster's authoritative value on FIN.
    pub nr_copies: u32,
    /// Resolved cluster status (meaningful on FIN).
    pub cluster_status: ClusterStatus,
    /// The joiner's latest epoch on INIT; the master's epoch on FIN.
    pub epoch: u32,
    /// Cluster creation time.
    pub ctime: u64,
    /// Sanity-check outcome; 0 is success.
    pub result: u32,
    /// Set when every node must bump and persist its epoch on apply.
    pub inc_epoch: bool,
    /// The joiner's known node list on INIT; the ratified storage roster
    /// on FIN.
    pub nodes: Vec<(NodeId, NodeEntry)>,
    /// Known-departed nodes, carried only while the cluster is waiting
    /// for its previous members to rejoin.
    pub leave_nodes: Vec<(NodeId, NodeEntry)>,
}

impl JoinMessage {
    pub fn new(from_id: NodeId, from_entry: NodeEntry) -> Self {
        Self {
            header: MessageHeader::new(Opcode::Join, MsgState::Init, from_id, from_entry),
            nr_copies: 0,
            cluster_status: ClusterStatus::WaitForFormat,
            epoch: 0,
            ctime: 0,
            result: 0,
            inc_epoch: false,
            nodes: Vec::new(),
            leave_nodes: Vec::new(),
        }
    }

    fn body_to_bytes(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.nodes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.nr_copies.to_le_bytes());
        buf.extend_from_slice(&self.cluster_status.to_code().to_le_bytes());
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.extend_from_slice(&self.ctime.to_le_bytes());
        buf.extend_from_slice(&self.result.to_le_bytes());
        buf.push(self.inc_epoch as u8);
        buf.extend_from_slice(&[0u8; 3]); // pad
        for (id, ent) in &self.nodes {
            id.to_bytes(buf);
            ent.to_bytes(buf);
        }
        buf.extend_from_slice(&(self.leave_nodes.len() as u32).to_le_bytes());
        for (id, ent) in &self.leave_nodes {
            id.to_bytes(buf);
            ent.to_bytes(buf);
        }
    }

    fn body_from_reader(header: MessageHeader, r: &mut Reader<'_>) -> SdResult<Self> {
        let nr_nodes = r.u32()? as usize;
        let nr_copies = r.u32()?;
        let cluster_status = ClusterStatus::from_code(r.u32()?)?;
        let epoch = r.u32()?;
        let ctime = r.u64()?;
        let result = r.u32()?;
        let inc_epoch = r.u8()? != 0;
        r.skip(3)?;
        let nodes = r.node_pairs(nr_nodes)?;
        let nr_leave = r.u32()? as usize;
        let leave_nodes = r.node_pairs(nr_leave)?;
        Ok(Self {
            header,
            nr_copies,
            cluster_status,
            epoch,
            ctime,
            result,
            inc_epoch,
            nodes,
            leave_nodes,
        })
    }
}

/// Voluntary departure announcement, always broadcast with `FIN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveMessage {
    pub header: MessageHeader,
    /// The departing node's latest known epoch.
    pub epoch: u32,
}

/// Mastership hand-off, always broadcast with `FIN`. The sender exits
/// after the broadcast; the next node in roster order observes itself as
/// master on its next event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterTransferMessage {
    pub header: MessageHeader,
    pub epoch: u32,
}

/// Master-change notification (reserved opcode, decoded but not emitted
/// by the current protocols).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterChangedMessage {
    pub header: MessageHeader,
}

/// VDI control opcodes forwarded through the ordered bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VdiOpcode {
    New = 1,
    Del = 2,
    Lock = 3,
    GetInfo = 4,
    GetAttr = 5,
    Release = 6,
    MakeFs = 7,
    Shutdown = 8,
}

impl VdiOpcode {
    pub fn from_u8(v: u8) -> SdResult<Self> {
        match v {
            1 => Ok(Self::New),
            2 => Ok(Self::Del),
            3 => Ok(Self::Lock),
            4 => Ok(Self::GetInfo),
            5 => Ok(Self::GetAttr),
            6 => Ok(Self::Release),
            7 => Ok(Self::MakeFs),
            8 => Ok(Self::Shutdown),
            _ => Err(SdError::InvalidParms),
        }
    }
}

/// Client VDI request header as carried inside a [`VdiOpMessage`].
/// 48 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdiRequest {
    pub proto_ver: u8,
    pub opcode: VdiOpcode,
    pub flags: u16,
    pub epoch: u32,
    /// Originator-local request id, used to complete the right pending
    /// client request when the FIN comes back.
    pub req_id: u64,
    pub vdi_size: u64,
    pub base_vid: u32,
    pub copies: u32,
    pub snapid: u32,
    /// Cluster creation time (format only).
    pub ctime: u64,
    pub data_length: u32,
}

impl VdiRequest {
    pub fn new(opcode: VdiOpcode) -> Self {
        Self {
            proto_ver: crate::constants::SD_PROTO_VER,
            opcode,
            flags: 0,
            epoch: 0,
            req_id: 0,
            vdi_size: 0,
            base_vid: 0,
            copies: 0,
            snapid: 0,
            ctime: 0,
            data_length: 0,
        }
    }

    fn to_bytes(&self, buf: &mut Vec<u8>) {
        buf.push(self.proto_ver);
        buf.push(self.opcode as u8);
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.extend_from_slice(&self.req_id.to_le_bytes());
        buf.extend_from_slice(&self.vdi_size.to_le_bytes());
        buf.extend_from_slice(&self.base_vid.to_le_bytes());
        buf.extend_from_slice(&self.copies.to_le_bytes());
        buf.extend_from_slice(&self.snapid.to_le_bytes());
        buf.extend_from_slice(&self.ctime.to_le_bytes());
        buf.extend_from_slice(&self.data_length.to_le_bytes());
    }

    fn from_reader(r: &mut Reader<'_>) -> SdResult<Self> {
        Ok(Self {
            proto_ver: r.u8()?,
            opcode: VdiOpcode::from_u8(r.u8()?)?,
            flags: r.u16()?,
            epoch: r.u32()?,
            req_id: r.u64()?,
            vdi_size: r.u64()?,
            base_vid: r.u32()?,
            copies: r.u32()?,
            snapid: r.u32()?,
            ctime: r.u64()?,
            data_length: r.u32()?,
        })
    }
}

/// VDI response header as carried inside a [`VdiOpMessage`].
/// 20 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VdiResponse {
    pub result: u32,
    pub vdi_id: u32,
    pub attr_id: u32,
    pub copies: u32,
    pub data_length: u32,
}

impl VdiResponse {
    fn to_bytes(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.result.to_le_bytes());
        buf.extend_from_slice(&self.vdi_id.to_le_bytes());
        buf.extend_from_slice(&self.attr_id.to_le_bytes());
        buf.extend_from_slice(&self.copies.to_le_bytes());
        buf.extend_from_slice(&self.data_length.to_le_bytes());
    }

    fn from_reader(r: &mut Reader<'_>) -> SdResult<Self> {
        Ok(Self {
            result: r.u32()?,
            vdi_id: r.u32()?,
            attr_id: r.u32()?,
            copies: r.u32()?,
            data_length: r.u32()?,
        })
    }
}

/// A VDI control operation in flight on the bus: the original client
/// request header, the response being filled by the master, and the
/// opaque request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VdiOpMessage {
    pub header: MessageHeader,
    pub req: VdiRequest,
    pub rsp: VdiResponse,
    pub data: Vec<u8>,
}

/// Decoded broadcast message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Join(JoinMessage),
    Leave(LeaveMessage),
    VdiOp(VdiOpMessage),
    MasterChanged(MasterChangedMessage),
    MasterTransfer(MasterTransferMessage),
}

impl Message {
    pub fn header(&self) -> &MessageHeader {
        match self {
            Message::Join(m) => &m.header,
            Message::Leave(m) => &m.header,
            Message::VdiOp(m) => &m.header,
            Message::MasterChanged(m) => &m.header,
            Message::MasterTransfer(m) => &m.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut MessageHeader {
        match self {
            Message::Join(m) => &mut m.header,
            Message::Leave(m) => &mut m.header,
            Message::VdiOp(m) => &mut m.header,
            Message::MasterChanged(m) => &mut m.header,
            Message::MasterTransfer(m) => &mut m.header,
        }
    }

    /// Serialize to the wire layout, filling in `msg_length`.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Message::Join(m) => m.body_to_bytes(&mut body),
            Message::Leave(m) => body.extend_from_slice(&m.epoch.to_le_bytes()),
            Message::MasterTransfer(m) => body.extend_from_slice(&m.epoch.to_le_bytes()),
            Message::MasterChanged(_) => {}
            Message::VdiOp(m) => {
                m.req.to_bytes(&mut body);
                m.rsp.to_bytes(&mut body);
                body.extend_from_slice(&m.data);
            }
        }

        let mut header = *self.header();
        header.msg_length = (MSG_HEADER_SIZE + body.len()) as u32;

        let mut buf = Vec::with_capacity(header.msg_length as usize);
        header.to_bytes(&mut buf);
        buf.extend_from_slice(&body);
        buf
    }

    pub fn decode(buf: &[u8]) -> SdResult<Message> {
        let mut r = Reader::new(buf);
        let header = MessageHeader::from_reader(&mut r)?;
        if (header.msg_length as usize) > buf.len() {
            return Err(SdError::InvalidParms);
        }
        match header.op {
            Opcode::Join => Ok(Message::Join(JoinMessage::body_from_reader(header, &mut r)?)),
            Opcode::Leave => Ok(Message::Leave(LeaveMessage {
                header,
                epoch: r.u32()?,
            })),
            Opcode::MasterTransfer => Ok(Message::MasterTransfer(MasterTransferMessage {
                header,
                epoch: r.u32()?,
            })),
            Opcode::MasterChanged => Ok(Message::MasterChanged(MasterChangedMessage { header })),
            Opcode::VdiOp => {
                let req = VdiRequest::from_reader(&mut r)?;
                let rsp = VdiResponse::from_reader(&mut r)?;
                let data = r.rest().to_vec();
                Ok(Message::VdiOp(VdiOpMessage {
                    header,
                    req,
                    rsp,
                    data,
                }))
            }
        }
    }
}

/// Little-endian cursor over a wire buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> SdResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(SdError::InvalidParms);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn skip(&mut self, n: usize) -> SdResult<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> SdResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> SdResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap_or_default()))
    }

    fn u32(&mut self) -> SdResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap_or_default()))
    }

    fn u64(&mut self) -> SdResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap_or_default()))
    }

    fn node_id(&mut self) -> SdResult<NodeId> {
        NodeId::from_bytes(self.take(NODE_ID_SIZE)?)
    }

    fn node_entry(&mut self) -> SdResult<NodeEntry> {
        NodeEntry::from_bytes(self.take(NODE_ENTRY_SIZE)?)
    }

    fn node_pairs(&mut self, n: usize) -> SdResult<Vec<(NodeId, NodeEntry)>> {
        if n > SD_MAX_NODES {
            return Err(SdError::InvalidParms);
        }
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            let id = self.node_id()?;
            let ent = self.node_entry()?;
            v.push((id, ent));
        }
        Ok(v)
    }

    fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_identity(n: u8) -> (NodeId, NodeEntry) {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, n));
        (NodeId::new(ip, n as u64), NodeEntry::new(ip, 7000))
    }

    #[test]
    fn test_header_layout() {
        let (id, ent) = test_identity(1);
        let msg = Message::Leave(LeaveMessage {
            header: MessageHeader::new(Opcode::Leave, MsgState::Fin, id, ent),
            epoch: 9,
        });
        let buf = msg.encode();

        // proto_ver, pad, op, state at fixed offsets
        assert_eq!(buf[0], SD_NODE_PROTO_VER);
        assert_eq!(buf[1], 0);
        assert_eq!(buf[2], Opcode::Leave as u8);
        assert_eq!(buf[3], MsgState::Fin as u8);
        // msg_length covers the whole buffer
        let len = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        assert_eq!(len as usize, buf.len());
        assert_eq!(buf.len(), MSG_HEADER_SIZE + 4);
    }

    #[test]
    fn test_join_round_trip() {
        let (id, ent) = test_identity(1);
        let (id2, ent2) = test_identity(2);
        let mut jm = JoinMessage::new(id, ent);
        jm.nr_copies = 3;
        jm.cluster_status = ClusterStatus::WaitForJoin;
        jm.epoch = 5;
        jm.ctime = 0xdead_beef;
        jm.inc_epoch = true;
        jm.nodes = vec![(id, ent), (id2, ent2)];
        jm.leave_nodes = vec![(id2, ent2)];

        let buf = Message::Join(jm.clone()).encode();
        match Message::decode(&buf).unwrap() {
            Message::Join(mut got) => {
                got.header.msg_length = 0;
                jm.header.msg_length = 0;
                assert_eq!(got, jm);
            }
            other => panic!("expected Join, got {:?}", other),
        }
    }

    #[test]
    fn test_vdi_op_round_trip() {
        let (id, ent) = test_identity(3);
        let mut req = VdiRequest::new(VdiOpcode::New);
        req.vdi_size = 1 << 30;
        req.copies = 3;
        req.req_id = 77;
        req.data_length = 5;
        let msg = Message::VdiOp(VdiOpMessage {
            header: MessageHeader::new(Opcode::VdiOp, MsgState::Init, id, ent),
            req,
            rsp: VdiResponse::default(),
            data: b"alice".to_vec(),
        });

        let buf = msg.encode();
        match Message::decode(&buf).unwrap() {
            Message::VdiOp(got) => {
                assert_eq!(got.req, req);
                assert_eq!(got.data, b"alice");
            }
            other => panic!("expected VdiOp, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_truncated() {
        let (id, ent) = test_identity(1);
        let buf = Message::Join(JoinMessage::new(id, ent)).encode();
        assert!(Message::decode(&buf[..buf.len() - 2]).is_err());
        assert!(Message::decode(&buf[..3]).is_err());
    }

    #[test]
    fn test_decode_bad_opcode() {
        let (id, ent) = test_identity(1);
        let mut buf = Message::Join(JoinMessage::new(id, ent)).encode();
        buf[2] = 0xff;
        assert_eq!(Message::decode(&buf), Err(SdError::InvalidParms));
    }

    #[test]
    fn test_node_count_limit() {
        let (id, ent) = test_identity(1);
        let mut buf = Message::Join(JoinMessage::new(id, ent)).encode();
        // Corrupt nr_nodes to an absurd count
        let off = MSG_HEADER_SIZE;
        buf[off..off + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(Message::decode(&buf).is_err());
    }
}
