//! VDI layer collaborator interface.
//!
//! The master executes VDI control operations against this interface
//! while handling a `VDI_OP` broadcast; the snapshot/backup semantics
//! behind it belong to the VDI layer proper. The in-memory implementation
//! here backs single-node deployments and tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use flock_proto::constants::SD_MAX_VDI_LEN;
use flock_proto::defaults::DEFAULT_MAX_VDI_HASH_RETRIES;
use flock_proto::error::{SdError, SdResult};
use flock_proto::hash::{sd_hash, sd_hash_vdi};

#[async_trait]
pub trait VdiLayer: Send + Sync {
    /// Create a VDI; returns the allocated vid.
    async fn add(
        &self,
        epoch: u32,
        name: &str,
        size: u64,
        base_vid: u32,
        copies: u32,
        snapid: u32,
    ) -> SdResult<u32>;

    /// Delete a VDI (or one snapshot of it); returns the vid.
    async fn del(&self, epoch: u32, name: &str, snapid: u32) -> SdResult<u32>;

    /// Resolve a VDI name (and optional snapshot id) to its vid.
    async fn lookup(&self, epoch: u32, name: &str, snapid: u32) -> SdResult<u32>;

    /// Resolve an attribute key to its attr id, creating it when asked.
    async fn get_attr(
        &self,
        epoch: u32,
        vid: u32,
        key: &str,
        create: bool,
        excl: bool,
    ) -> SdResult<u32>;

    /// Drop all VDI state (cluster format).
    async fn reset(&self);
}

/// Extract the VDI name from an opaque request payload: the bytes up to
/// the first NUL, valid UTF-8, bounded by the protocol name limit.
pub fn name_from_data(data: &[u8]) -> SdResult<&str> {
    let end = data
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(data.len())
        .min(SD_MAX_VDI_LEN);
    std::str::from_utf8(&data[..end]).map_err(|_| SdError::InvalidParms)
}

#[derive(Debug, Clone)]
struct VdiInfo {
    vid: u32,
    snapid: u32,
    copies: u32,
}

#[derive(Default)]
struct MemState {
    vdis: BTreeMap<String, VdiInfo>,
    vids: BTreeMap<u32, String>,
    attrs: BTreeMap<(u32, String), u32>,
    next_attr: u32,
}

/// In-memory VDI layer.
#[derive(Default)]
pub struct MemVdiLayer {
    state: Mutex<MemState>,
}

impl MemVdiLayer {
    fn free_vid(state: &MemState, name: &str) -> SdResult<u32> {
        let mut vid = sd_hash_vdi(name).max(1);
        for _ in 0..DEFAULT_MAX_VDI_HASH_RETRIES {
            if !state.vids.contains_key(&vid) {
                return Ok(vid);
            }
            vid = (vid + 1).max(1) % flock_proto::constants::SD_NR_VDIS;
            if vid == 0 {
                vid = 1;
            }
        }
        Err(SdError::NoMem)
    }
}

#[async_trait]
impl VdiLayer for MemVdiLayer {
    async fn add(
        &self,
        _epoch: u32,
        name: &str,
        _size: u64,
        _base_vid: u32,
        copies: u32,
        snapid: u32,
    ) -> SdResult<u32> {
        if name.is_empty() || name.len() > SD_MAX_VDI_LEN {
            return Err(SdError::InvalidParms);
        }
        let mut state = self.state.lock().map_err(|_| SdError::SystemError)?;
        if state.vdis.contains_key(name) {
            return Err(SdError::VdiExist);
        }
        let vid = Self::free_vid(&state, name)?;
        state.vdis.insert(
            name.to_string(),
            VdiInfo {
                vid,
                snapid,
                copies,
            },
        );
        state.vids.insert(vid, name.to_string());
        debug!("created vdi {} => {:#x}", name, vid);
        Ok(vid)
    }

    async fn del(&self, _epoch: u32, name: &str, _snapid: u32) -> SdResult<u32> {
        let mut state = self.state.lock().map_err(|_| SdError::SystemError)?;
        let info = state.vdis.remove(name).ok_or(SdError::NoVdi)?;
        state.vids.remove(&info.vid);
        debug!("deleted vdi {} => {:#x}", name, info.vid);
        Ok(info.vid)
    }

    async fn lookup(&self, _epoch: u32, name: &str, snapid: u32) -> SdResult<u32> {
        let state = self.state.lock().map_err(|_| SdError::SystemError)?;
        let info = state.vdis.get(name).ok_or(SdError::NoVdi)?;
        if snapid != 0 && info.snapid != snapid {
            return Err(SdError::NoVdi);
        }
        Ok(info.vid)
    }

    async fn get_attr(
        &self,
        _epoch: u32,
        vid: u32,
        key: &str,
        create: bool,
        excl: bool,
    ) -> SdResult<u32> {
        let mut state = self.state.lock().map_err(|_| SdError::SystemError)?;
        let attr_key = (vid, key.to_string());
        if let Some(&attr_id) = state.attrs.get(&attr_key) {
            if create && excl {
                return Err(SdError::VdiExist);
            }
            return Ok(attr_id);
        }
        if !create {
            return Err(SdError::NoTag);
        }
        state.next_attr += 1;
        let attr_id = (sd_hash(key.as_bytes()) as u32) ^ state.next_attr;
        state.attrs.insert(attr_key, attr_id);
        Ok(attr_id)
    }

    async fn reset(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = MemState::default();
        }
    }
}
