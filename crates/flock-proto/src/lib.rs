//! # flock-proto
//!
//! Protocol types, constants, and data structures for the flock
//! distributed storage system.
//!
//! This crate defines the cluster broadcast envelope, node identities,
//! error types, and the hash functions shared by all flock components.

pub mod constants;
pub mod defaults;
pub mod error;
pub mod hash;
pub mod message;
pub mod node;
pub mod request;

// Re-export commonly used types at the crate root
pub use error::{SdError, SdResult};
pub use message::{Message, MsgState, Opcode};
pub use node::{ClusterStatus, NodeEntry, NodeId};
