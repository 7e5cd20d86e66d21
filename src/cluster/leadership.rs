use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::meta::{MetaError, MetaStore};

/// Decides whether this node may run continuous queries right now
#[async_trait]
pub trait LeadershipGate: Send + Sync {
    async fn is_leader(&self) -> bool;
}

/// Leadership backed by a metadata store lease, re-acquired on every check
pub struct LeaseGate {
    meta: Arc<dyn MetaStore>,
    lease_name: String,
    node_id: u64,
}

impl LeaseGate {
    pub fn new(meta: Arc<dyn MetaStore>, lease_name: &str, node_id: u64) -> Self {
        Self {
            meta,
            lease_name: lease_name.to_string(),
            node_id,
        }
    }
}

#[async_trait]
impl LeadershipGate for LeaseGate {
    async fn is_leader(&self) -> bool {
        match self.meta.acquire_lease(&self.lease_name, self.node_id).await {
            Ok(lease) if lease.owner == self.node_id => true,
            Ok(lease) => {
                debug!("Lease {} granted to node {}, not {}", lease.name, lease.owner, self.node_id);
                false
            }
            Err(MetaError::LeaseHeld { owner, .. }) => {
                debug!("Lease {} is held by node {}", self.lease_name, owner);
                false
            }
            Err(e) => {
                warn!("Failed to acquire lease {}: {}", self.lease_name, e);
                false
            }
        }
    }
}
