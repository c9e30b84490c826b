//! Estimation service management
//!
//! Manages a bounded pool (typically one instance) of estimation
//! processes. The numeric formula itself is an external collaborator; this
//! module owns lifecycle only: gate the first start on output-sink
//! reachability, restart on failure with the fleet backoff policy, and
//! drain cleanly on undeploy. An output sink that stays unreachable past
//! the retry budget is fatal and surfaced as `BackendUnavailable`.

use crate::distributor::Published;
use crate::error::{PipelineError, Result};
use crate::models::EstimationServiceSpec;
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::runner::{LaunchSpec, ProcessHandle, ProcessRunner};
use crate::sink::{parse_sink_uri, SinkProbe};
use crate::state::{EntityKind, LifecycleState, StateTable};
use crate::supervisor::{BackoffConfig, RestartBackoff};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Tunables for the estimation service manager.
#[derive(Debug, Clone)]
pub struct EstimationManagerConfig {
    /// Number of estimation instances to keep alive.
    pub pool_size: usize,
    pub backoff: BackoffConfig,
    /// Consecutive process failures before an instance degrades.
    pub failure_cap: u32,
    /// Deadline for a single output-sink probe.
    pub probe_timeout: Duration,
    /// Probe attempts before the output sink is declared unavailable.
    pub probe_attempts: u32,
    pub start_timeout: Duration,
    /// Deadline for draining the in-flight batch on shutdown.
    pub drain_timeout: Duration,
    pub liveness_interval: Duration,
}

impl Default for EstimationManagerConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            backoff: BackoffConfig::default(),
            failure_cap: 3,
            probe_timeout: Duration::from_secs(5),
            probe_attempts: 5,
            start_timeout: Duration::from_secs(15),
            drain_timeout: Duration::from_secs(15),
            liveness_interval: Duration::from_secs(2),
        }
    }
}

struct InstanceHandle {
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Supervises the estimation process pool.
pub struct EstimationManager {
    config: EstimationManagerConfig,
    state: StateTable,
    runner: Arc<dyn ProcessRunner>,
    probe: Arc<dyn SinkProbe>,
    logger: StructuredLogger,
    metrics: ControllerMetrics,
    active: AtomicBool,
    activity_changed: Notify,
    instances: Mutex<Vec<InstanceHandle>>,
}

impl EstimationManager {
    pub fn new(
        config: EstimationManagerConfig,
        state: StateTable,
        runner: Arc<dyn ProcessRunner>,
        probe: Arc<dyn SinkProbe>,
        logger: StructuredLogger,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            config,
            state,
            runner,
            probe,
            logger,
            metrics,
            active: AtomicBool::new(false),
            activity_changed: Notify::new(),
            instances: Mutex::new(Vec::new()),
        }
    }

    /// Mark the pipeline deployed or undeployed. Instances only run while
    /// active.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        self.activity_changed.notify_one();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Run the manager until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut config_rx: watch::Receiver<Option<Published<EstimationServiceSpec>>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut config_open = true;

        loop {
            Self::spawn_pool_if_needed(&self, &mut config_rx).await;

            tokio::select! {
                res = config_rx.changed(), if config_open => {
                    match res {
                        Ok(()) => {
                            debug!("Estimation configuration changed, restarting pool");
                            self.stop_all().await;
                        }
                        Err(_) => config_open = false,
                    }
                }
                _ = self.activity_changed.notified() => {
                    if !self.is_active() {
                        self.stop_all().await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down estimation manager");
                    break;
                }
            }
        }

        self.stop_all().await;
    }

    async fn spawn_pool_if_needed(
        this: &Arc<Self>,
        config_rx: &mut watch::Receiver<Option<Published<EstimationServiceSpec>>>,
    ) {
        if !this.is_active() {
            return;
        }

        let mut instances = this.instances.lock().await;
        if !instances.is_empty() {
            return;
        }

        let current = config_rx.borrow_and_update().clone();
        let Some(published) = current else {
            return;
        };

        for i in 0..this.config.pool_size {
            let entity_id = format!("estimation-{i}");
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let task = tokio::spawn(Arc::clone(this).supervise_instance(
                entity_id,
                published.config.clone(),
                published.hash.clone(),
                cancel_rx,
            ));
            instances.push(InstanceHandle { cancel_tx, task });
        }
    }

    /// Drain and stop every instance: the in-flight batch gets the drain
    /// timeout to flush before the process is reaped.
    pub async fn stop_all(&self) {
        let mut instances = self.instances.lock().await;
        let grace = self.config.drain_timeout + Duration::from_secs(1);

        for handle in instances.drain(..) {
            let _ = handle.cancel_tx.send(true);
            let mut task = handle.task;
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }
    }

    /// Number of instances currently in the `Running` state.
    pub fn running_count(&self) -> usize {
        self.state
            .count_in_state(EntityKind::EstimationInstance, LifecycleState::Running)
    }

    async fn supervise_instance(
        self: Arc<Self>,
        entity_id: String,
        spec: EstimationServiceSpec,
        hash: String,
        mut cancel: watch::Receiver<bool>,
    ) {
        self.state.register(&entity_id, EntityKind::EstimationInstance);

        // Re-check the output scheme even though publish validated it:
        // an unsupported sink must never reach a process start.
        let output = match spec.primary_output() {
            Some(output) => output.clone(),
            None => {
                self.state
                    .record_failure(&entity_id, "no output sink configured");
                self.state.set_state(&entity_id, LifecycleState::Degraded);
                return;
            }
        };
        let parsed_output = match parse_sink_uri(&output.uri) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.state.record_failure(&entity_id, e.to_string());
                self.state.set_state(&entity_id, LifecycleState::Degraded);
                warn!(entity_id = %entity_id, error = %e, "Estimation output sink rejected");
                return;
            }
        };

        // Gate the first start on output reachability within the budget.
        if let Err(e) = self
            .ensure_output_reachable(&entity_id, &parsed_output, &mut cancel)
            .await
        {
            if let PipelineError::BackendUnavailable { attempts, message } = &e {
                self.logger
                    .log_backend_unavailable(&entity_id, *attempts, message);
            }
            self.state.record_failure(&entity_id, e.to_string());
            self.state.set_state(&entity_id, LifecycleState::Degraded);
            return;
        }

        let launch = match serde_json::to_value(&spec) {
            Ok(value) => LaunchSpec {
                name: entity_id.clone(),
                config: value,
            },
            Err(e) => {
                self.state.record_failure(&entity_id, e.to_string());
                self.state.set_state(&entity_id, LifecycleState::Terminated);
                return;
            }
        };

        let mut backoff = RestartBackoff::new(self.config.backoff.clone());

        loop {
            if *cancel.borrow() {
                self.state.set_state(&entity_id, LifecycleState::Terminated);
                break;
            }

            self.state.set_state(&entity_id, LifecycleState::Starting);

            let started =
                tokio::time::timeout(self.config.start_timeout, self.runner.start(&launch)).await;
            let handle = match started {
                Ok(Ok(handle)) => handle,
                Ok(Err(e)) => {
                    if self
                        .crash(&entity_id, &mut backoff, &mut cancel, e.to_string())
                        .await
                    {
                        continue;
                    }
                    break;
                }
                Err(_) => {
                    let msg = format!(
                        "estimation start exceeded {}s",
                        self.config.start_timeout.as_secs()
                    );
                    if self.crash(&entity_id, &mut backoff, &mut cancel, msg).await {
                        continue;
                    }
                    break;
                }
            };

            self.state.record_started(&entity_id, Some(hash.clone()));
            backoff.reset();
            debug!(entity_id = %entity_id, hash = %hash, "Estimation instance running");

            if self.monitor(handle.as_ref(), &mut cancel).await {
                // Cancelled: drain the in-flight batch, close the output.
                debug!(entity_id = %entity_id, "Draining estimation instance");
                if let Err(e) = handle.stop(self.config.drain_timeout).await {
                    warn!(entity_id = %entity_id, error = %e, "Drain did not finish cleanly");
                }
                self.state.set_state(&entity_id, LifecycleState::Terminated);
                break;
            }

            // Crashed
            if !self
                .crash(
                    &entity_id,
                    &mut backoff,
                    &mut cancel,
                    "estimation process exited".to_string(),
                )
                .await
            {
                break;
            }
        }
    }

    /// Probe the output sink with backoff until it answers or the budget is
    /// spent.
    async fn ensure_output_reachable(
        &self,
        entity_id: &str,
        output: &crate::sink::ParsedSink,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut backoff = RestartBackoff::new(self.config.backoff.clone());
        let mut last_error = String::new();

        for attempt in 1..=self.config.probe_attempts {
            if *cancel.borrow() {
                return Ok(());
            }

            let started = tokio::time::Instant::now();
            match self.probe.probe(output, self.config.probe_timeout).await {
                Ok(()) => {
                    self.metrics
                        .observe_probe_latency(started.elapsed().as_secs_f64());
                    return Ok(());
                }
                Err(e) => {
                    self.metrics
                        .observe_probe_latency(started.elapsed().as_secs_f64());
                    last_error = e.to_string();
                    debug!(
                        entity_id = %entity_id,
                        attempt = attempt,
                        error = %last_error,
                        "Output sink probe failed"
                    );
                }
            }

            if attempt < self.config.probe_attempts {
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancelled(cancel) => return Ok(()),
                }
            }
        }

        Err(PipelineError::BackendUnavailable {
            attempts: self.config.probe_attempts,
            message: last_error,
        })
    }

    /// Returns true when cancelled, false when the process crashed.
    async fn monitor(&self, handle: &dyn ProcessHandle, cancel: &mut watch::Receiver<bool>) -> bool {
        let mut ticker = tokio::time::interval(self.config.liveness_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !handle.is_alive().await {
                        return false;
                    }
                }
                _ = cancelled(cancel) => {
                    return true;
                }
            }
        }
    }

    /// Record a crash; true means retry after backoff, false means the
    /// instance reached a terminal state.
    async fn crash(
        &self,
        entity_id: &str,
        backoff: &mut RestartBackoff,
        cancel: &mut watch::Receiver<bool>,
        error: String,
    ) -> bool {
        let failures = self.state.record_failure(entity_id, &error);

        if failures >= self.config.failure_cap {
            self.state.set_state(entity_id, LifecycleState::Degraded);
            self.logger.log_degraded(entity_id, failures);
            return false;
        }

        self.state.set_state(entity_id, LifecycleState::CrashLoop);
        let delay = backoff.next_delay();
        self.logger
            .log_agent_restart(entity_id, failures, delay.as_millis() as u64);
        self.metrics.inc_estimation_restarts();

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancelled(cancel) => {
                self.state.set_state(entity_id, LifecycleState::Terminated);
                false
            }
        }
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CalibrationParams, CredentialsRef, SinkDescriptor};
    use crate::sink::ParsedSink;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct StaticProbe {
        reachable: bool,
        probes: AtomicU32,
    }

    impl StaticProbe {
        fn new(reachable: bool) -> Self {
            Self {
                reachable,
                probes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SinkProbe for StaticProbe {
        async fn probe(&self, _sink: &ParsedSink, _timeout: Duration) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.reachable {
                Ok(())
            } else {
                Err(PipelineError::TransientUnavailable("unreachable".into()))
            }
        }
    }

    struct AlwaysUpRunner;

    #[derive(Debug)]
    struct UpHandle {
        alive: AtomicBool,
    }

    #[async_trait]
    impl ProcessHandle for UpHandle {
        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn stop(&self, _timeout: Duration) -> Result<()> {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl ProcessRunner for AlwaysUpRunner {
        async fn start(&self, _spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
            Ok(Box::new(UpHandle {
                alive: AtomicBool::new(true),
            }))
        }
    }

    fn sink(uri: &str) -> SinkDescriptor {
        SinkDescriptor {
            uri: uri.to_string(),
            database: "power".to_string(),
            collection: "power_reports".to_string(),
            credentials: Some(CredentialsRef {
                secret_name: "storage-credentials".to_string(),
            }),
        }
    }

    fn estimation_spec(output_uri: &str) -> EstimationServiceSpec {
        EstimationServiceSpec {
            input: sink("mongodb://storage:27017/telemetry"),
            outputs: vec![sink(output_uri)],
            multiplex: false,
            calibration: CalibrationParams {
                base_frequency_mhz: 1900,
                min_frequency_mhz: 400,
                max_frequency_mhz: 4200,
                tdp_watts: 125.0,
                error_threshold_watts: 2.0,
                reference_event: "RAPL_ENERGY_PKG".to_string(),
                min_samples: 10,
                history_window: 60,
                real_time_mode: false,
            },
            sampling_interval_ms: 1000,
        }
    }

    fn fast_manager(probe: Arc<StaticProbe>) -> Arc<EstimationManager> {
        let config = EstimationManagerConfig {
            pool_size: 1,
            backoff: BackoffConfig {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(40),
                jitter: 0.0,
            },
            failure_cap: 3,
            probe_timeout: Duration::from_millis(100),
            probe_attempts: 3,
            start_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(1),
            liveness_interval: Duration::from_millis(20),
        };

        Arc::new(EstimationManager::new(
            config,
            StateTable::new(),
            Arc::new(AlwaysUpRunner),
            probe,
            StructuredLogger::new("test-controller"),
            ControllerMetrics::new(),
        ))
    }

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
    async fn test_instance_starts_when_output_reachable() {
        let probe = Arc::new(StaticProbe::new(true));
        let manager = fast_manager(Arc::clone(&probe));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&manager).supervise_instance(
            "estimation-0".to_string(),
            estimation_spec("influxdb://metrics-db:8086/power"),
            "hash-1".to_string(),
            cancel_rx,
        ));

        let m = Arc::clone(&manager);
        assert!(wait_for(|| m.running_count() == 1, Duration::from_secs(2)).await);

        let record = manager.state.get("estimation-0").unwrap();
        assert_eq!(record.applied_hash.as_deref(), Some("hash-1"));

        cancel_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(
            manager.state.get("estimation-0").unwrap().state,
            LifecycleState::Terminated
        );
    }

    #[tokio::test]
    async fn test_backend_unavailable_after_probe_budget() {
        let probe = Arc::new(StaticProbe::new(false));
        let manager = fast_manager(Arc::clone(&probe));

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        Arc::clone(&manager)
            .supervise_instance(
                "estimation-0".to_string(),
                estimation_spec("influxdb://metrics-db:8086/power"),
                "hash-1".to_string(),
                cancel_rx,
            )
            .await;

        let record = manager.state.get("estimation-0").unwrap();
        assert_eq!(record.state, LifecycleState::Degraded);
        assert!(record
            .last_error
            .as_deref()
            .unwrap()
            .contains("backend unavailable"));
        // Full budget spent, never started
        assert_eq!(probe.probes.load(Ordering::SeqCst), 3);
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_output_scheme_never_starts() {
        let probe = Arc::new(StaticProbe::new(true));
        let manager = fast_manager(Arc::clone(&probe));

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        Arc::clone(&manager)
            .supervise_instance(
                "estimation-0".to_string(),
                estimation_spec("ftp://metrics-db/power"),
                "hash-1".to_string(),
                cancel_rx,
            )
            .await;

        let record = manager.state.get("estimation-0").unwrap();
        assert_eq!(record.state, LifecycleState::Degraded);
        assert!(record
            .last_error
            .as_deref()
            .unwrap()
            .contains("unsupported sink scheme"));
        // Not even a probe happened
        assert_eq!(probe.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_inactive_manager_spawns_nothing() {
        let probe = Arc::new(StaticProbe::new(true));
        let manager = fast_manager(Arc::clone(&probe));

        let (config_tx, config_rx) = watch::channel(Some(Published {
            hash: "hash-1".to_string(),
            version: 1,
            config: estimation_spec("influxdb://metrics-db:8086/power"),
        }));
        let (shutdown_tx, _) = broadcast::channel(1);

        let task = tokio::spawn(Arc::clone(&manager).run(config_rx, shutdown_tx.subscribe()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.running_count(), 0);

        // Deploy: the pool comes up
        manager.set_active(true);
        let m = Arc::clone(&manager);
        assert!(wait_for(|| m.running_count() == 1, Duration::from_secs(2)).await);

        // Undeploy: the pool drains
        manager.set_active(false);
        let m = Arc::clone(&manager);
        assert!(wait_for(|| m.running_count() == 0, Duration::from_secs(2)).await);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        drop(config_tx);
    }
}
