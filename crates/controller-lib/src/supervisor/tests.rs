//! Supervision tests against a scripted process runner.

use super::*;
use crate::distributor::ConfigDistributor;
use crate::error::{PipelineError, Result};
use crate::models::{CollectorConfig, CredentialsRef, SinkDescriptor};
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::rollout::RolloutTracker;
use crate::runner::{LaunchSpec, ProcessHandle, ProcessRunner};
use crate::state::{EntityKind, LifecycleState, StateTable};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

/// Process handle whose liveness the test controls.
#[derive(Debug)]
struct ScriptedHandle {
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl ProcessHandle for ScriptedHandle {
    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn stop(&self, _timeout: Duration) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Runner that fails a scripted number of starts, then hands out handles
/// the test can kill.
struct ScriptedRunner {
    failures_before_success: AtomicU32,
    start_count: AtomicU32,
    last_alive: std::sync::Mutex<Option<Arc<AtomicBool>>>,
}

impl ScriptedRunner {
    fn new(failures_before_success: u32) -> Self {
        Self {
            failures_before_success: AtomicU32::new(failures_before_success),
            start_count: AtomicU32::new(0),
            last_alive: std::sync::Mutex::new(None),
        }
    }

    fn starts(&self) -> u32 {
        self.start_count.load(Ordering::SeqCst)
    }

    /// Simulate a crash of the most recently started process.
    fn kill_current(&self) {
        if let Some(alive) = self.last_alive.lock().unwrap().as_ref() {
            alive.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn start(&self, _spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        self.start_count.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failures_before_success.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_before_success
                .store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::TransientUnavailable(
                "scripted start failure".to_string(),
            ));
        }

        let alive = Arc::new(AtomicBool::new(true));
        *self.last_alive.lock().unwrap() = Some(Arc::clone(&alive));
        Ok(Box::new(ScriptedHandle { alive }))
    }
}

fn collector_config(frequency: u64) -> CollectorConfig {
    CollectorConfig {
        sampling_frequency_hz: frequency,
        system_events: vec!["RAPL_ENERGY_PKG".to_string()],
        container_events: vec![],
        sink: SinkDescriptor {
            uri: "mongodb://storage:27017/telemetry".to_string(),
            database: "telemetry".to_string(),
            collection: "raw_reports".to_string(),
            credentials: Some(CredentialsRef {
                secret_name: "storage-credentials".to_string(),
            }),
        },
    }
}

fn test_context(runner: Arc<ScriptedRunner>) -> SupervisorContext {
    SupervisorContext {
        state: StateTable::new(),
        leases: LeaseRegistry::new(),
        rollout: RolloutTracker::new(),
        runner,
        logger: StructuredLogger::new("test-controller"),
        metrics: ControllerMetrics::new(),
    }
}

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        backoff: BackoffConfig {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(40),
            jitter: 0.0,
        },
        failure_cap: 3,
        start_timeout: Duration::from_secs(1),
        stop_timeout: Duration::from_secs(1),
        liveness_interval: Duration::from_millis(20),
    }
}

/// Poll until the predicate holds or the deadline passes.
async fn wait_for<F: Fn() -> bool>(predicate: F, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

#[tokio::test]
async fn test_agent_reaches_running_and_applies_hash() {
    let runner = Arc::new(ScriptedRunner::new(0));
    let ctx = test_context(Arc::clone(&runner));

    let distributor = ConfigDistributor::new();
    let outcome = distributor.publish_collector(collector_config(10)).unwrap();
    ctx.rollout.set_target(&outcome.hash).await;
    ctx.rollout.register_node("node-1");

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = tokio::spawn(supervise_node_agent(
        "node-1".to_string(),
        ctx.clone(),
        fast_config(),
        distributor.subscribe_collector(),
        cancel_rx,
    ));

    let state = ctx.state.clone();
    assert!(
        wait_for(
            || state
                .get("node-1")
                .map(|r| r.state == LifecycleState::Running)
                .unwrap_or(false),
            Duration::from_secs(2)
        )
        .await
    );

    let record = ctx.state.get("node-1").unwrap();
    assert_eq!(record.applied_hash.as_deref(), Some(outcome.hash.as_str()));
    assert!(ctx.rollout.state().await.converged);

    cancel_tx.send(true).unwrap();
    task.await.unwrap();
    assert_eq!(
        ctx.state.get("node-1").unwrap().state,
        LifecycleState::Terminated
    );
    // Lease released on task exit
    assert!(!ctx.leases.is_held("node-1"));
}

#[tokio::test]
async fn test_degraded_after_failure_cap() {
    // Every start fails
    let runner = Arc::new(ScriptedRunner::new(u32::MAX));
    let ctx = test_context(Arc::clone(&runner));

    let distributor = ConfigDistributor::new();
    distributor.publish_collector(collector_config(10)).unwrap();

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let task = tokio::spawn(supervise_node_agent(
        "node-1".to_string(),
        ctx.clone(),
        fast_config(),
        distributor.subscribe_collector(),
        cancel_rx,
    ));

    task.await.unwrap();

    let record = ctx.state.get("node-1").unwrap();
    assert_eq!(record.state, LifecycleState::Degraded);
    assert_eq!(record.consecutive_failures, 3);
    assert_eq!(runner.starts(), 3);

    // Degraded is terminal: no further restart attempts happen.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runner.starts(), 3);
}

#[tokio::test]
async fn test_lease_prevents_duplicate_agent() {
    let runner = Arc::new(ScriptedRunner::new(0));
    let ctx = test_context(Arc::clone(&runner));

    let distributor = ConfigDistributor::new();
    distributor.publish_collector(collector_config(10)).unwrap();

    let _held = ctx.leases.acquire("node-1").unwrap();

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    supervise_node_agent(
        "node-1".to_string(),
        ctx.clone(),
        fast_config(),
        distributor.subscribe_collector(),
        cancel_rx,
    )
    .await;

    // The duplicate never started a process
    assert_eq!(runner.starts(), 0);
    assert!(ctx.state.get("node-1").unwrap().last_error.is_some());
}

#[tokio::test]
async fn test_cancel_during_backoff_terminates_within_a_second() {
    let runner = Arc::new(ScriptedRunner::new(u32::MAX));
    let ctx = test_context(Arc::clone(&runner));

    let distributor = ConfigDistributor::new();
    distributor.publish_collector(collector_config(10)).unwrap();

    // Long backoff so the task is certainly sleeping when we cancel
    let config = SupervisorConfig {
        backoff: BackoffConfig {
            base: Duration::from_secs(20),
            cap: Duration::from_secs(30),
            jitter: 0.0,
        },
        ..fast_config()
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = tokio::spawn(supervise_node_agent(
        "node-1".to_string(),
        ctx.clone(),
        config,
        distributor.subscribe_collector(),
        cancel_rx,
    ));

    let state = ctx.state.clone();
    assert!(
        wait_for(
            || state
                .get("node-1")
                .map(|r| r.state == LifecycleState::CrashLoop)
                .unwrap_or(false),
            Duration::from_secs(2)
        )
        .await
    );

    let started = tokio::time::Instant::now();
    cancel_tx.send(true).unwrap();
    task.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(
        ctx.state.get("node-1").unwrap().state,
        LifecycleState::Terminated
    );
}

#[tokio::test]
async fn test_config_change_restarts_agent_with_new_hash() {
    let runner = Arc::new(ScriptedRunner::new(0));
    let ctx = test_context(Arc::clone(&runner));

    let distributor = ConfigDistributor::new();
    distributor.publish_collector(collector_config(10)).unwrap();

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = tokio::spawn(supervise_node_agent(
        "node-1".to_string(),
        ctx.clone(),
        fast_config(),
        distributor.subscribe_collector(),
        cancel_rx,
    ));

    let state = ctx.state.clone();
    assert!(
        wait_for(
            || state
                .get("node-1")
                .map(|r| r.state == LifecycleState::Running)
                .unwrap_or(false),
            Duration::from_secs(2)
        )
        .await
    );

    let second = distributor.publish_collector(collector_config(20)).unwrap();

    let state = ctx.state.clone();
    let target = second.hash.clone();
    assert!(
        wait_for(
            || state
                .get("node-1")
                .map(|r| r.applied_hash.as_deref() == Some(target.as_str()))
                .unwrap_or(false),
            Duration::from_secs(2)
        )
        .await
    );

    assert_eq!(runner.starts(), 2);
    // A rollout restart is not a crash
    assert_eq!(ctx.state.get("node-1").unwrap().consecutive_failures, 0);

    cancel_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_crash_restarts_and_clears_failure_streak() {
    let runner = Arc::new(ScriptedRunner::new(0));
    let ctx = test_context(Arc::clone(&runner));

    let distributor = ConfigDistributor::new();
    distributor.publish_collector(collector_config(10)).unwrap();

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = tokio::spawn(supervise_node_agent(
        "node-1".to_string(),
        ctx.clone(),
        fast_config(),
        distributor.subscribe_collector(),
        cancel_rx,
    ));

    let state = ctx.state.clone();
    assert!(
        wait_for(
            || state
                .get("node-1")
                .map(|r| r.state == LifecycleState::Running)
                .unwrap_or(false),
            Duration::from_secs(2)
        )
        .await
    );

    runner.kill_current();

    let runner_ref = Arc::clone(&runner);
    let state = ctx.state.clone();
    assert!(
        wait_for(
            || runner_ref.starts() == 2
                && state
                    .get("node-1")
                    .map(|r| r.state == LifecycleState::Running)
                    .unwrap_or(false),
            Duration::from_secs(2)
        )
        .await
    );

    // A successful restart clears the streak
    assert_eq!(ctx.state.get("node-1").unwrap().consecutive_failures, 0);

    cancel_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_fleet_join_leave_and_undeploy() {
    let runner = Arc::new(ScriptedRunner::new(0));
    let ctx = test_context(Arc::clone(&runner));

    let distributor = ConfigDistributor::new();
    distributor.publish_collector(collector_config(10)).unwrap();

    let fleet = Arc::new(FleetSupervisor::new(
        ctx.clone(),
        fast_config(),
        distributor.subscribe_collector(),
    ));

    let (events_tx, events_rx) = mpsc::channel(16);
    let (shutdown_tx, _) = broadcast::channel(1);
    let fleet_task = tokio::spawn(Arc::clone(&fleet).run(events_rx, shutdown_tx.subscribe()));

    for node in ["node-1", "node-2"] {
        events_tx
            .send(NodeEvent::Joined {
                node_id: node.to_string(),
            })
            .await
            .unwrap();
    }

    let fleet_ref = Arc::clone(&fleet);
    assert!(wait_for(|| fleet_ref.running_count() == 2, Duration::from_secs(2)).await);
    assert_eq!(fleet.fleet_size(), 2);

    // Node leaves: its records disappear
    events_tx
        .send(NodeEvent::Left {
            node_id: "node-2".to_string(),
        })
        .await
        .unwrap();

    let state = ctx.state.clone();
    assert!(wait_for(|| state.get("node-2").is_none(), Duration::from_secs(2)).await);
    assert!(!ctx.leases.is_held("node-2"));

    // Shutdown terminates the remaining agent
    shutdown_tx.send(()).unwrap();
    fleet_task.await.unwrap();

    assert_eq!(
        ctx.state.get("node-1").unwrap().state,
        LifecycleState::Terminated
    );
    assert_eq!(
        ctx.state
            .count_in_state(EntityKind::NodeAgent, LifecycleState::Running),
        0
    );
}
