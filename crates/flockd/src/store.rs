//! Object-store collaborator interface.
//!
//! The replicated object backend lives outside the membership core. The
//! core drives it through two calls: kicking off recovery after a
//! committed membership change, and asking whether an object is still
//! being migrated so requests against it can be gated.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use flock_proto::error::SdResult;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// A new epoch has been committed; rebalance objects onto the new
    /// ring.
    async fn start_recovery(&self, epoch: u32) -> SdResult<()>;

    /// Whether `oid` is currently being recovered.
    fn is_recovering(&self, oid: u64) -> bool;
}

/// Store stub for a node with no object backend wired (gateway-only
/// deployments and tests). Recovery requests are acknowledged and logged;
/// nothing is ever recovering.
#[derive(Default)]
pub struct NullStore {
    epochs: Mutex<Vec<u32>>,
}

impl NullStore {
    /// Epochs for which recovery was requested, in order.
    pub fn recovery_epochs(&self) -> Vec<u32> {
        self.epochs.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for NullStore {
    async fn start_recovery(&self, epoch: u32) -> SdResult<()> {
        info!("recovery requested for epoch {} (no backend)", epoch);
        if let Ok(mut v) = self.epochs.lock() {
            v.push(epoch);
        }
        Ok(())
    }

    fn is_recovering(&self, _oid: u64) -> bool {
        false
    }
}

/// Test double with an explicit set of recovering objects.
#[derive(Default)]
pub struct FixedRecoveryStore {
    recovering: Mutex<HashSet<u64>>,
    epochs: Mutex<Vec<u32>>,
}

impl FixedRecoveryStore {
    pub fn set_recovering(&self, oid: u64, on: bool) {
        if let Ok(mut set) = self.recovering.lock() {
            if on {
                set.insert(oid);
            } else {
                set.remove(&oid);
            }
        }
    }

    pub fn recovery_epochs(&self) -> Vec<u32> {
        self.epochs.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for FixedRecoveryStore {
    async fn start_recovery(&self, epoch: u32) -> SdResult<()> {
        if let Ok(mut v) = self.epochs.lock() {
            v.push(epoch);
        }
        Ok(())
    }

    fn is_recovering(&self, oid: u64) -> bool {
        self.recovering
            .lock()
            .map(|set| set.contains(&oid))
            .unwrap_or(false)
    }
}
