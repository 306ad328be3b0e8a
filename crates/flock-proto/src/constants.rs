/// Flock protocol and system constants.

/// Client protocol version
pub const SD_PROTO_VER: u8 = 0x01;
/// Internal node-to-node protocol version (cluster broadcasts)
pub const SD_NODE_PROTO_VER: u8 = 0x02;

/// Default listen port for client connections
pub const SD_LISTEN_PORT: u16 = 7000;

/// Default number of copies
pub const SD_DEFAULT_COPIES: u32 = 3;

/// Default virtual nodes per physical node
pub const SD_DEFAULT_VNODES: u16 = 64;
/// Maximum nodes in a cluster
pub const SD_MAX_NODES: usize = 512;

/// Total number of VDIs (2^24 = 16M)
pub const SD_NR_VDIS: u32 = 1 << 24;

/// Maximum VDI name length
pub const SD_MAX_VDI_LEN: usize = 256;

/// Wire size of a NodeId record
pub const NODE_ID_SIZE: usize = 24;
/// Wire size of a NodeEntry record
pub const NODE_ENTRY_SIZE: usize = 24;
/// Wire size of the broadcast message header
pub const MSG_HEADER_SIZE: usize = 8 + NODE_ID_SIZE + NODE_ENTRY_SIZE;

/// Request flag: execute locally, do not forward through the gateway
pub const SD_FLAG_CMD_DIRECT: u16 = 0x0001;
/// Request flag: issued by the recovery worker itself
pub const SD_FLAG_CMD_RECOVERY: u16 = 0x0002;
/// Request flag: carries a write payload
pub const SD_FLAG_CMD_WRITE: u16 = 0x0004;
/// Request flag: create the target if missing (attribute ops)
pub const SD_FLAG_CMD_CREAT: u16 = 0x0008;
/// Request flag: fail if the target already exists (attribute ops)
pub const SD_FLAG_CMD_EXCL: u16 = 0x0010;
