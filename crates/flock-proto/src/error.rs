/// Flock error types.
///
/// All result codes from both the client protocol (0x00-0x1F) and the
/// internal node-to-node protocol (0x81-0x9F) are represented as a single
/// enum. Success is the absence of an error (`Ok(())`); on the wire it is
/// code 0.

use serde::{Deserialize, Serialize};

/// Unified error type for all flock operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum SdError {
    #[error("unknown error")]
    Unknown,
    #[error("I/O error")]
    Eio,
    #[error("VDI exists already")]
    VdiExist,
    #[error("invalid parameters")]
    InvalidParms,
    #[error("system error")]
    SystemError,
    #[error("no VDI found")]
    NoVdi,
    #[error("requested tag not found")]
    NoTag,
    #[error("cluster is shutting down")]
    Shutdown,
    #[error("cannot allocate memory")]
    NoMem,
    #[error("protocol version mismatch")]
    VerMismatch,
    #[error("waiting for cluster format")]
    WaitForFormat,
    #[error("waiting for nodes to join")]
    WaitForJoin,
    #[error("join failed")]
    JoinFailed,
    #[error("cluster is halted")]
    Halt,

    // Internal errors (node-to-node protocol)
    #[error("request has an old epoch")]
    OldNodeVer,
    #[error("request has a new epoch")]
    NewNodeVer,
    #[error("cluster is not formatted")]
    NotFormatted,
    #[error("invalid creation time")]
    InvalidCtime,
    #[error("invalid epoch")]
    InvalidEpoch,
    #[error("network error between nodes")]
    NetworkError,
    #[error("cluster driver error")]
    ClusterError,
}

impl SdError {
    /// Convert from a raw protocol result code. Code 0 means success.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x00 => None,
            0x01 => Some(Self::Unknown),
            0x03 => Some(Self::Eio),
            0x04 => Some(Self::VdiExist),
            0x05 => Some(Self::InvalidParms),
            0x06 => Some(Self::SystemError),
            0x08 => Some(Self::NoVdi),
            0x0E => Some(Self::NoTag),
            0x11 => Some(Self::Shutdown),
            0x12 => Some(Self::NoMem),
            0x14 => Some(Self::VerMismatch),
            0x16 => Some(Self::WaitForFormat),
            0x17 => Some(Self::WaitForJoin),
            0x18 => Some(Self::JoinFailed),
            0x19 => Some(Self::Halt),
            0x81 => Some(Self::OldNodeVer),
            0x82 => Some(Self::NewNodeVer),
            0x83 => Some(Self::NotFormatted),
            0x84 => Some(Self::InvalidCtime),
            0x85 => Some(Self::InvalidEpoch),
            0x86 => Some(Self::NetworkError),
            0x91 => Some(Self::ClusterError),
            _ => Some(Self::Unknown),
        }
    }

    /// Convert to a raw protocol result code.
    pub fn to_code(self) -> u32 {
        match self {
            Self::Unknown => 0x01,
            Self::Eio => 0x03,
            Self::VdiExist => 0x04,
            Self::InvalidParms => 0x05,
            Self::SystemError => 0x06,
            Self::NoVdi => 0x08,
            Self::NoTag => 0x0E,
            Self::Shutdown => 0x11,
            Self::NoMem => 0x12,
            Self::VerMismatch => 0x14,
            Self::WaitForFormat => 0x16,
            Self::WaitForJoin => 0x17,
            Self::JoinFailed => 0x18,
            Self::Halt => 0x19,
            Self::OldNodeVer => 0x81,
            Self::NewNodeVer => 0x82,
            Self::NotFormatted => 0x83,
            Self::InvalidCtime => 0x84,
            Self::InvalidEpoch => 0x85,
            Self::NetworkError => 0x86,
            Self::ClusterError => 0x91,
        }
    }

    /// Encode a result for the wire: 0 on success, the error code otherwise.
    pub fn code_of(res: &SdResult<()>) -> u32 {
        match res {
            Ok(()) => 0,
            Err(e) => e.to_code(),
        }
    }

    /// Decode a wire result code back into a result.
    pub fn result_of(code: u32) -> SdResult<()> {
        match Self::from_code(code) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Result type alias for flock operations.
pub type SdResult<T> = Result<T, SdError>;

impl From<std::io::Error> for SdError {
    fn from(_: std::io::Error) -> Self {
        SdError::Eio
    }
}
