//! Per-node agent supervision
//!
//! One supervision task per cluster node. The task owns the node lease for
//! its whole lifetime, drives the agent through the
//! `Pending → Starting → Running → (CrashLoop ⇄ Starting) → Degraded |
//! Terminated` state machine, and applies configuration changes with
//! read-modify-apply semantics: an in-flight restart completes before a
//! newer config hash is picked up.

use super::backoff::{BackoffConfig, RestartBackoff};
use super::lease::LeaseRegistry;
use crate::distributor::Published;
use crate::models::{CollectorConfig, NodeAgentSpec};
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::rollout::RolloutTracker;
use crate::runner::{LaunchSpec, ProcessHandle, ProcessRunner};
use crate::state::{EntityKind, LifecycleState, StateTable};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Tunables for agent supervision.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub backoff: BackoffConfig,
    /// Consecutive failures before an entity is marked `Degraded`.
    pub failure_cap: u32,
    /// Deadline for a process start.
    pub start_timeout: Duration,
    /// Deadline for a process stop.
    pub stop_timeout: Duration,
    /// Interval between liveness checks while running.
    pub liveness_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            failure_cap: 3,
            start_timeout: Duration::from_secs(15),
            stop_timeout: Duration::from_secs(15),
            liveness_interval: Duration::from_secs(2),
        }
    }
}

/// Shared collaborators handed to every supervision task.
#[derive(Clone)]
pub struct SupervisorContext {
    pub state: StateTable,
    pub leases: LeaseRegistry,
    pub rollout: RolloutTracker,
    pub runner: Arc<dyn ProcessRunner>,
    pub logger: StructuredLogger,
    pub metrics: ControllerMetrics,
}

/// Why the running-state monitor returned.
enum RunExit {
    Crashed,
    ConfigChanged,
    Cancelled,
}

/// What to do after a crash was recorded.
enum CrashOutcome {
    Retry,
    Degraded,
    Cancelled,
}

/// Resolves once the cancel flag turns true or its sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Supervise the collector agent for one node until node-leave, undeploy,
/// or the failure cap is exceeded.
pub async fn supervise_node_agent(
    node_id: String,
    ctx: SupervisorContext,
    config: SupervisorConfig,
    mut config_rx: watch::Receiver<Option<Published<CollectorConfig>>>,
    mut cancel: watch::Receiver<bool>,
) {
    ctx.state.register(&node_id, EntityKind::NodeAgent);

    // At-most-one live agent per node: hold the lease for the whole task.
    let _lease = match ctx.leases.acquire(&node_id) {
        Ok(lease) => lease,
        Err(e) => {
            ctx.state.record_failure(&node_id, e.to_string());
            warn!(node_id = %node_id, "Lease already held, refusing duplicate agent");
            return;
        }
    };

    let mut backoff = RestartBackoff::new(config.backoff.clone());

    loop {
        if *cancel.borrow() {
            ctx.state.set_state(&node_id, LifecycleState::Terminated);
            break;
        }

        // Snapshot the newest published config; this restart runs to
        // completion with the hash captured here.
        let current = config_rx.borrow_and_update().clone();
        let published = match current {
            Some(published) => published,
            None => {
                tokio::select! {
                    res = config_rx.changed() => {
                        if res.is_err() {
                            ctx.state.set_state(&node_id, LifecycleState::Terminated);
                            break;
                        }
                    }
                    _ = cancelled(&mut cancel) => {
                        ctx.state.set_state(&node_id, LifecycleState::Terminated);
                        break;
                    }
                }
                continue;
            }
        };

        let spec = NodeAgentSpec::from_config(&node_id, &published.config);
        let launch = match serde_json::to_value(&spec) {
            Ok(value) => LaunchSpec {
                name: format!("collector-{node_id}"),
                config: value,
            },
            Err(e) => {
                ctx.state.record_failure(&node_id, e.to_string());
                ctx.state.set_state(&node_id, LifecycleState::Terminated);
                warn!(node_id = %node_id, error = %e, "Failed to render agent spec");
                break;
            }
        };

        ctx.state.set_state(&node_id, LifecycleState::Starting);

        let handle = match tokio::time::timeout(config.start_timeout, ctx.runner.start(&launch))
            .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                match crash(&node_id, &ctx, &config, &mut backoff, &mut cancel, e.to_string())
                    .await
                {
                    CrashOutcome::Retry => continue,
                    CrashOutcome::Degraded => break,
                    CrashOutcome::Cancelled => {
                        ctx.state.set_state(&node_id, LifecycleState::Terminated);
                        break;
                    }
                }
            }
            Err(_) => {
                let msg = format!("agent start exceeded {}s", config.start_timeout.as_secs());
                match crash(&node_id, &ctx, &config, &mut backoff, &mut cancel, msg).await {
                    CrashOutcome::Retry => continue,
                    CrashOutcome::Degraded => break,
                    CrashOutcome::Cancelled => {
                        ctx.state.set_state(&node_id, LifecycleState::Terminated);
                        break;
                    }
                }
            }
        };

        ctx.state.record_started(&node_id, Some(published.hash.clone()));
        ctx.rollout.mark_applied(&node_id, &published.hash);
        backoff.reset();
        debug!(node_id = %node_id, hash = %published.hash, "Agent running");

        let rollout_state = ctx.rollout.state().await;
        if rollout_state.converged {
            ctx.logger
                .log_rollout_converged(&published.hash, rollout_state.nodes.len());
        }

        match monitor_running(
            handle.as_ref(),
            config.liveness_interval,
            &mut config_rx,
            &mut cancel,
        )
        .await
        {
            RunExit::Cancelled => {
                stop_agent(&node_id, handle.as_ref(), config.stop_timeout).await;
                ctx.rollout.mark_not_ready(&node_id);
                ctx.state.set_state(&node_id, LifecycleState::Terminated);
                break;
            }
            RunExit::ConfigChanged => {
                debug!(node_id = %node_id, "Configuration changed, restarting agent");
                stop_agent(&node_id, handle.as_ref(), config.stop_timeout).await;
                ctx.rollout.mark_not_ready(&node_id);
                ctx.metrics.inc_agent_restarts();
                continue;
            }
            RunExit::Crashed => {
                ctx.rollout.mark_not_ready(&node_id);
                match crash(
                    &node_id,
                    &ctx,
                    &config,
                    &mut backoff,
                    &mut cancel,
                    "agent process exited".to_string(),
                )
                .await
                {
                    CrashOutcome::Retry => continue,
                    CrashOutcome::Degraded => break,
                    CrashOutcome::Cancelled => {
                        ctx.state.set_state(&node_id, LifecycleState::Terminated);
                        break;
                    }
                }
            }
        }
    }
}

/// Watch a running agent for crashes, configuration changes, and
/// cancellation.
async fn monitor_running(
    handle: &dyn ProcessHandle,
    liveness_interval: Duration,
    config_rx: &mut watch::Receiver<Option<Published<CollectorConfig>>>,
    cancel: &mut watch::Receiver<bool>,
) -> RunExit {
    let mut ticker = tokio::time::interval(liveness_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    let mut config_open = true;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !handle.is_alive().await {
                    return RunExit::Crashed;
                }
            }
            res = config_rx.changed(), if config_open => {
                match res {
                    Ok(()) => return RunExit::ConfigChanged,
                    Err(_) => config_open = false,
                }
            }
            _ = cancelled(cancel) => {
                return RunExit::Cancelled;
            }
        }
    }
}

/// Record a crash, then either back off for a retry, degrade past the cap,
/// or bail out on cancellation. The backoff sleep is cancellable.
async fn crash(
    node_id: &str,
    ctx: &SupervisorContext,
    config: &SupervisorConfig,
    backoff: &mut RestartBackoff,
    cancel: &mut watch::Receiver<bool>,
    error: String,
) -> CrashOutcome {
    let failures = ctx.state.record_failure(node_id, &error);

    if failures >= config.failure_cap {
        ctx.state.set_state(node_id, LifecycleState::Degraded);
        ctx.logger.log_degraded(node_id, failures);
        return CrashOutcome::Degraded;
    }

    ctx.state.set_state(node_id, LifecycleState::CrashLoop);
    let delay = backoff.next_delay();
    ctx.logger
        .log_agent_restart(node_id, failures, delay.as_millis() as u64);
    ctx.metrics.inc_agent_restarts();

    tokio::select! {
        _ = tokio::time::sleep(delay) => CrashOutcome::Retry,
        _ = cancelled(cancel) => CrashOutcome::Cancelled,
    }
}

async fn stop_agent(node_id: &str, handle: &dyn ProcessHandle, timeout: Duration) {
    if let Err(e) = handle.stop(timeout).await {
        warn!(node_id = %node_id, error = %e, "Agent did not stop cleanly");
    }
}
