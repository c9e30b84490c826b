//! Observability infrastructure for the pipeline controller
//!
//! Provides:
//! - Prometheus metrics (fleet gauges, restart counters, probe latency)
//! - Structured JSON logging for significant pipeline events

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for sink probe latency (in seconds).
const PROBE_LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct ControllerMetricsInner {
    pipeline_status: IntGauge,
    agents_running: IntGauge,
    agents_degraded: IntGauge,
    agent_restarts: IntCounter,
    estimation_restarts: IntCounter,
    config_publishes: IntCounterVec,
    config_noops: IntCounterVec,
    probe_latency_seconds: Histogram,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            pipeline_status: register_int_gauge!(
                "pipeline_controller_status",
                "Aggregate pipeline status (0=not_ready, 1=partially_ready, 2=ready)"
            )
            .expect("Failed to register pipeline_status"),

            agents_running: register_int_gauge!(
                "pipeline_controller_agents_running",
                "Number of node agents currently in the running state"
            )
            .expect("Failed to register agents_running"),

            agents_degraded: register_int_gauge!(
                "pipeline_controller_agents_degraded",
                "Number of node agents marked degraded"
            )
            .expect("Failed to register agents_degraded"),

            agent_restarts: register_int_counter!(
                "pipeline_controller_agent_restarts_total",
                "Total node agent restarts performed by the supervisor"
            )
            .expect("Failed to register agent_restarts"),

            estimation_restarts: register_int_counter!(
                "pipeline_controller_estimation_restarts_total",
                "Total estimation service instance restarts"
            )
            .expect("Failed to register estimation_restarts"),

            config_publishes: register_int_counter_vec!(
                "pipeline_controller_config_publishes_total",
                "Configuration documents accepted and published",
                &["config"]
            )
            .expect("Failed to register config_publishes"),

            config_noops: register_int_counter_vec!(
                "pipeline_controller_config_noops_total",
                "Configuration submissions rejected as unchanged",
                &["config"]
            )
            .expect("Failed to register config_noops"),

            probe_latency_seconds: register_histogram!(
                "pipeline_controller_probe_latency_seconds",
                "Time spent probing sink reachability",
                PROBE_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register probe_latency_seconds"),
        }
    }
}

/// Controller metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Record the aggregate pipeline status as a numeric gauge.
    pub fn set_pipeline_status(&self, value: i64) {
        self.inner().pipeline_status.set(value);
    }

    /// Update fleet gauges.
    pub fn set_fleet_counts(&self, running: i64, degraded: i64) {
        self.inner().agents_running.set(running);
        self.inner().agents_degraded.set(degraded);
    }

    pub fn inc_agent_restarts(&self) {
        self.inner().agent_restarts.inc();
    }

    pub fn inc_estimation_restarts(&self) {
        self.inner().estimation_restarts.inc();
    }

    pub fn inc_config_publishes(&self, config: &str) {
        self.inner()
            .config_publishes
            .with_label_values(&[config])
            .inc();
    }

    pub fn inc_config_noops(&self, config: &str) {
        self.inner().config_noops.with_label_values(&[config]).inc();
    }

    /// Record a sink probe latency observation.
    pub fn observe_probe_latency(&self, duration_secs: f64) {
        self.inner().probe_latency_seconds.observe(duration_secs);
    }
}

/// Structured logger for pipeline events
///
/// Provides consistent JSON-formatted logging for publishes, restarts,
/// rollouts, and other significant events.
#[derive(Clone)]
pub struct StructuredLogger {
    controller_id: String,
}

impl StructuredLogger {
    pub fn new(controller_id: impl Into<String>) -> Self {
        Self {
            controller_id: controller_id.into(),
        }
    }

    /// Log controller startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "controller_started",
            controller = %self.controller_id,
            version = %version,
            "Pipeline controller started"
        );
    }

    /// Log controller shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            controller = %self.controller_id,
            reason = %reason,
            "Pipeline controller shutting down"
        );
    }

    /// Log a configuration publish
    pub fn log_publish(&self, config: &str, hash: &str, version: u64) {
        info!(
            event = "config_published",
            controller = %self.controller_id,
            config = %config,
            hash = %hash,
            version = version,
            "Configuration published"
        );
    }

    /// Log a node joining the fleet
    pub fn log_node_joined(&self, node_id: &str) {
        info!(
            event = "node_joined",
            controller = %self.controller_id,
            node_id = %node_id,
            "Node joined, starting collector agent"
        );
    }

    /// Log a node leaving the fleet
    pub fn log_node_left(&self, node_id: &str) {
        info!(
            event = "node_left",
            controller = %self.controller_id,
            node_id = %node_id,
            "Node left, terminating collector agent"
        );
    }

    /// Log an agent restart attempt
    pub fn log_agent_restart(&self, entity_id: &str, failures: u32, delay_ms: u64) {
        warn!(
            event = "agent_restart",
            controller = %self.controller_id,
            entity_id = %entity_id,
            consecutive_failures = failures,
            backoff_ms = delay_ms,
            "Agent crashed, restarting after backoff"
        );
    }

    /// Log an entity crossing the failure cap
    pub fn log_degraded(&self, entity_id: &str, failures: u32) {
        warn!(
            event = "entity_degraded",
            controller = %self.controller_id,
            entity_id = %entity_id,
            consecutive_failures = failures,
            "Failure cap exceeded, entity degraded until operator intervention"
        );
    }

    /// Log an exhausted sink retry budget
    pub fn log_backend_unavailable(&self, entity_id: &str, attempts: u32, message: &str) {
        warn!(
            event = "backend_unavailable",
            controller = %self.controller_id,
            entity_id = %entity_id,
            attempts = attempts,
            error = %message,
            "Output sink unreachable after full backoff budget"
        );
    }

    /// Log rollout convergence
    pub fn log_rollout_converged(&self, hash: &str, nodes: usize) {
        info!(
            event = "rollout_converged",
            controller = %self.controller_id,
            hash = %hash,
            nodes = nodes,
            "All nodes converged to target configuration"
        );
    }

    /// Log an undeploy request
    pub fn log_undeploy(&self) {
        info!(
            event = "undeploy",
            controller = %self.controller_id,
            "Undeploy requested, draining pipeline"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_metrics_creation() {
        // Metrics register against the process-global Prometheus registry,
        // so this exercises handle creation and the update paths.
        let metrics = ControllerMetrics::new();

        metrics.set_pipeline_status(2);
        metrics.set_fleet_counts(7, 3);
        metrics.inc_agent_restarts();
        metrics.inc_estimation_restarts();
        metrics.inc_config_publishes("collector");
        metrics.inc_config_noops("collector");
        metrics.observe_probe_latency(0.004);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("controller-0");
        assert_eq!(logger.controller_id, "controller-0");
    }
}
