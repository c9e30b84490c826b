//! Pipeline health monitoring
//!
//! Polls the pipeline in dependency order: storage backend reachability
//! first, then collector-fleet readiness against the configured threshold,
//! then estimation-service readiness. The aggregate collapses to a single
//! `NotReady | PartiallyReady | Ready` status for the control surface.
//!
//! `PartiallyReady` (storage reachable, fleet below threshold) is a valid
//! steady state during rolling node updates, not an error.

use crate::observability::ControllerMetrics;
use crate::sink::{ParsedSink, SinkProbe};
use crate::state::{EntityKind, LifecycleState, StateTable};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// Aggregate pipeline status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    NotReady,
    PartiallyReady,
    Ready,
}

impl PipelineStatus {
    /// Numeric form for the status gauge.
    pub fn as_metric(&self) -> i64 {
        match self {
            PipelineStatus::NotReady => 0,
            PipelineStatus::PartiallyReady => 1,
            PipelineStatus::Ready => 2,
        }
    }
}

/// Health detail for a single probed component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentDetail {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentDetail {
    fn ready() -> Self {
        Self {
            ready: true,
            message: None,
        }
    }

    fn not_ready(message: impl Into<String>) -> Self {
        Self {
            ready: false,
            message: Some(message.into()),
        }
    }
}

/// Collector-fleet readiness summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetDetail {
    pub nodes_total: usize,
    pub nodes_running: usize,
    pub nodes_degraded: usize,
    /// Fraction of non-terminated nodes in the running state.
    pub readiness: f64,
    pub threshold: f64,
    pub meets_threshold: bool,
}

/// Full status report exposed by the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: PipelineStatus,
    pub storage: ComponentDetail,
    pub fleet: FleetDetail,
    pub estimation: ComponentDetail,
    pub checked_at: i64,
}

/// Tunables for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    /// Fraction of nodes that must be running for the fleet to count as
    /// ready (default 1.0, i.e. 100%).
    pub readiness_threshold: f64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            readiness_threshold: 1.0,
        }
    }
}

/// Polls pipeline components and aggregates their readiness.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    state: StateTable,
    probe: Arc<dyn SinkProbe>,
    metrics: ControllerMetrics,
    storage_sink: RwLock<Option<ParsedSink>>,
    latest: RwLock<Option<StatusReport>>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthMonitorConfig,
        state: StateTable,
        probe: Arc<dyn SinkProbe>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            config,
            state,
            probe,
            metrics,
            storage_sink: RwLock::new(None),
            latest: RwLock::new(None),
        }
    }

    /// Point the monitor at the storage backend. Set on deploy, cleared on
    /// undeploy.
    pub async fn set_storage_sink(&self, sink: Option<ParsedSink>) {
        let mut storage = self.storage_sink.write().await;
        *storage = sink;
    }

    /// Run the polling loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.check_once().await;
                    debug!(status = ?report.status, "Health check complete");

                    let mut latest = self.latest.write().await;
                    *latest = Some(report);
                }
                _ = shutdown.recv() => {
                    info!("Shutting down health monitor");
                    break;
                }
            }
        }
    }

    /// Poll all components once, in dependency order, and aggregate.
    pub async fn check_once(&self) -> StatusReport {
        let storage = self.check_storage().await;
        let fleet = self.check_fleet();
        let estimation = self.check_estimation();

        let status = Self::aggregate(&storage, &fleet, &estimation);

        self.metrics.set_pipeline_status(status.as_metric());
        self.metrics
            .set_fleet_counts(fleet.nodes_running as i64, fleet.nodes_degraded as i64);

        StatusReport {
            status,
            storage,
            fleet,
            estimation,
            checked_at: Utc::now().timestamp(),
        }
    }

    /// Latest report, polling on demand when the loop has not run yet.
    pub async fn current(&self) -> StatusReport {
        {
            let latest = self.latest.read().await;
            if let Some(report) = latest.as_ref() {
                return report.clone();
            }
        }

        let report = self.check_once().await;
        let mut latest = self.latest.write().await;
        *latest = Some(report.clone());
        report
    }

    async fn check_storage(&self) -> ComponentDetail {
        let sink = self.storage_sink.read().await.clone();
        let Some(sink) = sink else {
            return ComponentDetail::not_ready("no storage sink configured");
        };

        let started = tokio::time::Instant::now();
        let result = self.probe.probe(&sink, self.config.probe_timeout).await;
        self.metrics
            .observe_probe_latency(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => ComponentDetail::ready(),
            Err(e) => ComponentDetail::not_ready(e.to_string()),
        }
    }

    fn check_fleet(&self) -> FleetDetail {
        let snapshot = self.state.snapshot();

        let mut nodes_total = 0usize;
        let mut nodes_running = 0usize;
        let mut nodes_degraded = 0usize;

        for (_, record) in &snapshot {
            if record.kind != EntityKind::NodeAgent
                || record.state == LifecycleState::Terminated
            {
                continue;
            }
            nodes_total += 1;
            match record.state {
                LifecycleState::Running => nodes_running += 1,
                LifecycleState::Degraded => nodes_degraded += 1,
                _ => {}
            }
        }

        let readiness = if nodes_total == 0 {
            1.0
        } else {
            nodes_running as f64 / nodes_total as f64
        };

        FleetDetail {
            nodes_total,
            nodes_running,
            nodes_degraded,
            readiness,
            threshold: self.config.readiness_threshold,
            meets_threshold: readiness >= self.config.readiness_threshold,
        }
    }

    fn check_estimation(&self) -> ComponentDetail {
        let mut total = 0usize;
        let mut running = 0usize;
        let mut last_error = None;

        for (_, record) in self.state.snapshot() {
            if record.kind != EntityKind::EstimationInstance
                || record.state == LifecycleState::Terminated
            {
                continue;
            }
            total += 1;
            if record.state == LifecycleState::Running {
                running += 1;
            } else if record.last_error.is_some() {
                last_error = record.last_error;
            }
        }

        if total == 0 {
            ComponentDetail::not_ready("estimation service not deployed")
        } else if running == total {
            ComponentDetail::ready()
        } else {
            ComponentDetail::not_ready(
                last_error
                    .unwrap_or_else(|| format!("{running}/{total} instances running")),
            )
        }
    }

    /// Aggregation rule:
    /// - storage unreachable → `NotReady`
    /// - storage reachable, fleet below threshold → `PartiallyReady`
    /// - fleet at threshold but estimation not ready → `NotReady`
    /// - everything up → `Ready`
    fn aggregate(
        storage: &ComponentDetail,
        fleet: &FleetDetail,
        estimation: &ComponentDetail,
    ) -> PipelineStatus {
        if !storage.ready {
            PipelineStatus::NotReady
        } else if !fleet.meets_threshold {
            PipelineStatus::PartiallyReady
        } else if !estimation.ready {
            PipelineStatus::NotReady
        } else {
            PipelineStatus::Ready
        }
    }
}
