//! Rollout convergence tracking
//!
//! Tracks the target configuration hash against the hash each node actually
//! runs with. Transient divergence is expected mid-rollout; the supervisor's
//! restart loop drives every node back to the target without manual
//! intervention.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-node rollout progress.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRollout {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_hash: Option<String>,
    pub ready: bool,
}

/// Snapshot of rollout progress across the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_hash: Option<String>,
    pub nodes: HashMap<String, NodeRollout>,
    /// True when every node runs the target hash and reports ready.
    pub converged: bool,
}

/// Tracks applied-vs-target hashes for all supervised nodes.
#[derive(Clone, Default)]
pub struct RolloutTracker {
    target: Arc<RwLock<Option<String>>>,
    nodes: Arc<DashMap<String, NodeRollout>>,
}

impl RolloutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a new target hash. Nodes keep their applied hashes and converge
    /// through restarts.
    pub async fn set_target(&self, hash: impl Into<String>) {
        let mut target = self.target.write().await;
        *target = Some(hash.into());
    }

    pub async fn target(&self) -> Option<String> {
        self.target.read().await.clone()
    }

    /// Track a node that joined the fleet.
    pub fn register_node(&self, node_id: &str) {
        self.nodes
            .entry(node_id.to_string())
            .or_insert_with(NodeRollout::default);
    }

    /// Record that a node now runs the given hash.
    pub fn mark_applied(&self, node_id: &str, hash: impl Into<String>) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            entry.applied_hash = Some(hash.into());
            entry.ready = true;
        }
    }

    /// Record that a node's agent is no longer serving (crash, restart).
    pub fn mark_not_ready(&self, node_id: &str) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            entry.ready = false;
        }
    }

    /// Forget a node that left the cluster.
    pub fn remove_node(&self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    /// Nodes not yet running the target hash.
    pub async fn pending_nodes(&self) -> Vec<String> {
        let target = self.target.read().await.clone();
        let Some(target) = target else {
            return Vec::new();
        };

        self.nodes
            .iter()
            .filter(|r| !r.ready || r.applied_hash.as_deref() != Some(target.as_str()))
            .map(|r| r.key().clone())
            .collect()
    }

    /// Point-in-time snapshot with the convergence verdict.
    pub async fn state(&self) -> RolloutState {
        let target = self.target.read().await.clone();

        let nodes: HashMap<String, NodeRollout> = self
            .nodes
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();

        let converged = match &target {
            Some(hash) => nodes
                .values()
                .all(|n| n.ready && n.applied_hash.as_deref() == Some(hash.as_str())),
            // No target yet: nothing to converge to.
            None => true,
        };

        RolloutState {
            target_hash: target,
            nodes,
            converged,
        }
    }
}
