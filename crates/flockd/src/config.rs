//! Cluster configuration persistence.
//!
//! A small record survives restarts next to the epoch log: the cluster
//! creation time and replication factor. A restarting node needs both to
//! pass the join sanity checks before it is allowed back in.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error};

use flock_proto::constants::SD_DEFAULT_COPIES;
use flock_proto::error::{SdError, SdResult};

/// Persisted cluster-wide settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster creation time, set once at format.
    pub ctime: u64,
    /// Default number of object copies.
    pub nr_copies: u32,
    /// Cluster behavior flags.
    pub flags: u16,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            ctime: 0,
            nr_copies: 0,
            flags: 0,
        }
    }
}

impl ClusterConfig {
    pub fn copies_or_default(&self) -> u32 {
        if self.nr_copies == 0 {
            SD_DEFAULT_COPIES
        } else {
            self.nr_copies
        }
    }
}

fn config_path(dir: &Path) -> std::path::PathBuf {
    dir.join("config")
}

/// Save the cluster config. Failures are reported but the caller decides
/// whether they are fatal.
pub async fn save_config(dir: &Path, config: &ClusterConfig) -> SdResult<()> {
    let path = config_path(dir);
    let data = bincode::serialize(config).map_err(|_| SdError::SystemError)?;
    fs::write(&path, &data).await.map_err(|e| {
        error!("failed to write config to {}: {}", path.display(), e);
        SdError::Eio
    })?;
    debug!(
        "saved config: ctime={:#x} copies={}",
        config.ctime, config.nr_copies
    );
    Ok(())
}

/// Load the cluster config, or defaults when none exists yet.
pub async fn load_config(dir: &Path) -> SdResult<ClusterConfig> {
    let path = config_path(dir);
    if !fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(ClusterConfig::default());
    }
    let data = fs::read(&path).await.map_err(|e| {
        error!("failed to read config from {}: {}", path.display(), e);
        SdError::Eio
    })?;
    bincode::deserialize(&data).map_err(|_| {
        error!("corrupt config file: {}", path.display());
        SdError::SystemError
    })
}
