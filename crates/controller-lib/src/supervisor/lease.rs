//! Per-node agent leases
//!
//! A lease must be held for the whole `Starting → Running` span of an
//! agent, guaranteeing at most one live agent instance per node. Dropping
//! the guard releases the lease.

use crate::error::{PipelineError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Registry of held node leases.
#[derive(Clone, Default)]
pub struct LeaseRegistry {
    held: Arc<DashMap<String, ()>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lease for a node.
    ///
    /// Fails with [`PipelineError::LeaseHeld`] if another agent instance
    /// already holds it.
    pub fn acquire(&self, node_id: &str) -> Result<NodeLease> {
        use dashmap::mapref::entry::Entry;

        match self.held.entry(node_id.to_string()) {
            Entry::Occupied(_) => Err(PipelineError::LeaseHeld(node_id.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(());
                debug!(node_id = %node_id, "Acquired node lease");
                Ok(NodeLease {
                    node_id: node_id.to_string(),
                    held: Arc::clone(&self.held),
                })
            }
        }
    }

    pub fn is_held(&self, node_id: &str) -> bool {
        self.held.contains_key(node_id)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

/// Guard over an acquired lease; released on drop.
#[derive(Debug)]
pub struct NodeLease {
    node_id: String,
    held: Arc<DashMap<String, ()>>,
}

impl NodeLease {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        self.held.remove(&self.node_id);
        debug!(node_id = %self.node_id, "Released node lease");
    }
}
