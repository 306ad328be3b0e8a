/// Client request surface seen by the cluster core.
///
/// The client RPC codec lives outside this crate; by the time a request
/// reaches the membership core it has been decoded into one of two
/// shapes: an object I/O request destined for a worker pool, or a VDI
/// control operation that must travel the ordered bus.

use serde::{Deserialize, Serialize};

use crate::constants::{SD_FLAG_CMD_DIRECT, SD_FLAG_CMD_RECOVERY, SD_FLAG_CMD_WRITE};
use crate::message::{VdiRequest, VdiResponse};

/// Object I/O opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoOpcode {
    CreateAndWrite,
    Read,
    Write,
    Remove,
}

/// One object I/O request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoRequest {
    pub opcode: IoOpcode,
    /// Target object.
    pub oid: u64,
    /// Copy-on-write source object, 0 if none.
    pub cow_oid: u64,
    /// Epoch the client believes is current.
    pub epoch: u32,
    /// SD_FLAG_CMD_* bits.
    pub flags: u16,
    pub offset: u32,
    pub data: Vec<u8>,
}

impl IoRequest {
    pub fn new(opcode: IoOpcode, oid: u64, epoch: u32) -> Self {
        Self {
            opcode,
            oid,
            cow_oid: 0,
            epoch,
            flags: match opcode {
                IoOpcode::Read => 0,
                _ => SD_FLAG_CMD_WRITE,
            },
            offset: 0,
            data: Vec::new(),
        }
    }

    /// Execute locally without gateway forwarding.
    pub fn is_direct(&self) -> bool {
        self.flags & SD_FLAG_CMD_DIRECT != 0
    }

    /// Issued by the recovery worker; exempt from recovery gating.
    pub fn is_recovery(&self) -> bool {
        self.flags & SD_FLAG_CMD_RECOVERY != 0
    }
}

/// A VDI control operation as submitted by a client, before it is wrapped
/// into a bus broadcast. `name` is the VDI (or attribute) key material and
/// travels as the opaque payload.
#[derive(Debug, Clone)]
pub struct VdiOpRequest {
    pub req: VdiRequest,
    pub data: Vec<u8>,
}

/// Completed VDI operation as seen by the submitting client.
#[derive(Debug, Clone)]
pub struct VdiOpReply {
    pub rsp: VdiResponse,
    pub data: Vec<u8>,
}

/// Serial-number comparison for epochs (wrap-safe).
#[inline]
pub fn epoch_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Serial-number comparison for epochs (wrap-safe).
#[inline]
pub fn epoch_after(a: u32, b: u32) -> bool {
    epoch_before(b, a)
}
