//! Fleet supervision
//!
//! Maintains the desired set of node agents, one per cluster node: spawns a
//! supervision task on node-join, cancels it on node-leave, and keeps the
//! rollout target in step with the latest published collector
//! configuration.

use super::agent::{supervise_node_agent, SupervisorConfig, SupervisorContext};
use crate::distributor::Published;
use crate::models::CollectorConfig;
use crate::state::{EntityKind, LifecycleState};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Cluster membership events consumed by the fleet supervisor.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Joined { node_id: String },
    Left { node_id: String },
}

struct AgentHandle {
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Supervises the collector agent fleet.
pub struct FleetSupervisor {
    ctx: SupervisorContext,
    config: SupervisorConfig,
    config_rx: watch::Receiver<Option<Published<CollectorConfig>>>,
    agents: DashMap<String, AgentHandle>,
}

impl FleetSupervisor {
    pub fn new(
        ctx: SupervisorContext,
        config: SupervisorConfig,
        config_rx: watch::Receiver<Option<Published<CollectorConfig>>>,
    ) -> Self {
        Self {
            ctx,
            config,
            config_rx,
            agents: DashMap::new(),
        }
    }

    /// Run the fleet loop until the event source closes or shutdown fires.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<NodeEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut config_rx = self.config_rx.clone();

        // Seed the rollout target from a config published before startup.
        let initial = config_rx.borrow_and_update().as_ref().map(|p| p.hash.clone());
        if let Some(hash) = initial {
            self.ctx.rollout.set_target(&hash).await;
        }

        let mut config_open = true;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(NodeEvent::Joined { node_id }) => self.node_joined(&node_id),
                    Some(NodeEvent::Left { node_id }) => self.node_left(&node_id).await,
                    None => {
                        debug!("Node event source closed");
                        break;
                    }
                },
                res = config_rx.changed(), if config_open => {
                    match res {
                        Ok(()) => {
                            let hash = config_rx
                                .borrow_and_update()
                                .as_ref()
                                .map(|p| p.hash.clone());
                            if let Some(hash) = hash {
                                self.ctx.rollout.set_target(&hash).await;
                            }
                        }
                        Err(_) => config_open = false,
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down fleet supervisor");
                    break;
                }
            }
        }

        self.undeploy_all().await;
    }

    /// Spawn a supervision task for a node that joined the cluster.
    pub fn node_joined(&self, node_id: &str) {
        if self.agents.contains_key(node_id) {
            debug!(node_id = %node_id, "Node already supervised, ignoring join");
            return;
        }

        self.ctx.logger.log_node_joined(node_id);
        self.ctx.rollout.register_node(node_id);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(supervise_node_agent(
            node_id.to_string(),
            self.ctx.clone(),
            self.config.clone(),
            self.config_rx.clone(),
            cancel_rx,
        ));

        self.agents
            .insert(node_id.to_string(), AgentHandle { cancel_tx, task });
    }

    /// Terminate the agent of a node that left the cluster and forget it.
    pub async fn node_left(&self, node_id: &str) {
        self.ctx.logger.log_node_left(node_id);

        if let Some((_, handle)) = self.agents.remove(node_id) {
            self.stop_agent_task(handle).await;
        }

        self.ctx.rollout.remove_node(node_id);
        self.ctx.state.remove(node_id);
    }

    /// Terminate every agent, leaving `Terminated` records in the state
    /// table for the status surface.
    pub async fn undeploy_all(&self) {
        let node_ids: Vec<String> = self.agents.iter().map(|r| r.key().clone()).collect();

        for node_id in node_ids {
            if let Some((_, handle)) = self.agents.remove(&node_id) {
                self.stop_agent_task(handle).await;
            }
            self.ctx.rollout.remove_node(&node_id);
        }
    }

    async fn stop_agent_task(&self, handle: AgentHandle) {
        let _ = handle.cancel_tx.send(true);

        // The task cancels its own backoff sleeps and process waits; the
        // grace period only guards against a stuck process stop.
        let grace = self.config.stop_timeout + Duration::from_secs(1);
        let mut task = handle.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            task.abort();
        }
    }

    /// Number of nodes currently supervised.
    pub fn fleet_size(&self) -> usize {
        self.agents.len()
    }

    /// Number of agents currently in the `Running` state.
    pub fn running_count(&self) -> usize {
        self.ctx
            .state
            .count_in_state(EntityKind::NodeAgent, LifecycleState::Running)
    }
}
