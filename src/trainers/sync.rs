//! Coordination between data-parallel training replicas
//!
//! Only the primary replica updates the adaptive loss buckets; the result is
//! then broadcast so every replica weighs the next batch identically.

use crate::error::Result;
use crate::gdf::AdaptiveLossState;

pub trait ReplicaSync {
    fn is_primary(&self) -> bool;

    /// Called on every replica after the primary's bucket update. The primary
    /// passes its state in; others receive the primary's state back.
    fn broadcast_loss_buckets(&self, state: AdaptiveLossState) -> Result<AdaptiveLossState>;
}

/// A single replica that is always primary.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl ReplicaSync for SingleProcess {
    fn is_primary(&self) -> bool {
        true
    }

    fn broadcast_loss_buckets(&self, state: AdaptiveLossState) -> Result<AdaptiveLossState> {
        Ok(state)
    }
}
