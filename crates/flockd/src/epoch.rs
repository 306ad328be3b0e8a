//! Durable epoch log.
//!
//! The epoch log is the source of truth for membership history: an
//! append-only directory mapping each committed epoch to the ordered node
//! list that was the storage roster at the moment the epoch was committed.
//! One file per epoch, named by the zero-padded epoch number, containing
//! concatenated fixed-layout [`NodeEntry`] records.
//!
//! Writes go through a temp file and rename so a crashed write never
//! leaves a torn epoch behind. Overwriting an existing epoch is permitted;
//! format relies on it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, error, warn};

use flock_proto::constants::NODE_ENTRY_SIZE;
use flock_proto::error::{SdError, SdResult};
use flock_proto::node::NodeEntry;

/// Fetches an epoch's node list from a peer when the local log lacks it.
/// The transport behind this lives with the gateway layer.
#[async_trait]
pub trait RemoteEpochSource: Send + Sync {
    async fn fetch(&self, epoch: u32, peer: &NodeEntry) -> SdResult<Vec<NodeEntry>>;
}

/// The on-disk epoch log.
pub struct EpochLog {
    dir: PathBuf,
    remote: Option<Arc<dyn RemoteEpochSource>>,
}

impl EpochLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            remote: None,
        }
    }

    pub fn with_remote(dir: impl Into<PathBuf>, remote: Arc<dyn RemoteEpochSource>) -> Self {
        Self {
            dir: dir.into(),
            remote: Some(remote),
        }
    }

    fn path(&self, epoch: u32) -> PathBuf {
        self.dir.join(format!("{:08}", epoch))
    }

    /// Write an epoch's node list atomically. A failure is logged and
    /// surfaced but the caller is expected to keep running.
    pub async fn write(&self, epoch: u32, nodes: &[NodeEntry]) -> SdResult<()> {
        let mut data = Vec::with_capacity(nodes.len() * NODE_ENTRY_SIZE);
        for node in nodes {
            node.to_bytes(&mut data);
        }

        let tmp = self.dir.join(format!(".{:08}.tmp", epoch));
        let path = self.path(epoch);
        let res = async {
            fs::create_dir_all(&self.dir).await?;
            fs::write(&tmp, &data).await?;
            fs::rename(&tmp, &path).await
        }
        .await;

        match res {
            Ok(()) => {
                debug!("wrote epoch {} with {} nodes", epoch, nodes.len());
                Ok(())
            }
            Err(e) => {
                error!("cannot write epoch {}: {}", epoch, e);
                let _ = fs::remove_file(&tmp).await;
                Err(SdError::Eio)
            }
        }
    }

    /// Read an epoch's node list. `NoTag` when the epoch is not in the log.
    pub async fn read(&self, epoch: u32) -> SdResult<Vec<NodeEntry>> {
        let data = match fs::read(self.path(epoch)).await {
            Ok(d) => d,
            Err(_) => return Err(SdError::NoTag),
        };
        if data.len() % NODE_ENTRY_SIZE != 0 {
            warn!("epoch {} log has a truncated record", epoch);
            return Err(SdError::NoTag);
        }
        data.chunks_exact(NODE_ENTRY_SIZE)
            .map(NodeEntry::from_bytes)
            .collect()
    }

    /// Read an epoch's node list, falling back to a peer when the local
    /// log lacks the epoch.
    pub async fn read_remote(&self, epoch: u32, peer: &NodeEntry) -> SdResult<Vec<NodeEntry>> {
        match self.read(epoch).await {
            Ok(nodes) => Ok(nodes),
            Err(SdError::NoTag) => match &self.remote {
                Some(remote) => remote.fetch(epoch, peer).await,
                None => Err(SdError::NoTag),
            },
            Err(e) => Err(e),
        }
    }

    /// The highest committed epoch, 0 when the log is empty.
    pub async fn latest(&self) -> u32 {
        let mut latest = 0u32;
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(_) => return 0,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(epoch) = name.parse::<u32>() {
                    latest = latest.max(epoch);
                }
            }
        }
        latest
    }

    /// Remove one epoch from the log. Only format uses this.
    pub async fn remove(&self, epoch: u32) -> SdResult<()> {
        match fs::remove_file(self.path(epoch)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!("cannot remove epoch {}: {}", epoch, e);
                Err(SdError::Eio)
            }
        }
    }
}
