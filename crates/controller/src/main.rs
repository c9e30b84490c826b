//! Pipeline Controller - orchestrates sensor-to-estimation power pipelines
//!
//! This binary supervises the per-node collector fleet and the estimation
//! service, distributes validated configuration, and serves the HTTP
//! control surface used by the `ppc` CLI.

use anyhow::Result;
use controller_lib::distributor::ConfigDistributor;
use controller_lib::estimation::EstimationManager;
use controller_lib::health::HealthMonitor;
use controller_lib::observability::{ControllerMetrics, StructuredLogger};
use controller_lib::rollout::RolloutTracker;
use controller_lib::runner::CommandRunner;
use controller_lib::sink::TcpSinkProbe;
use controller_lib::state::StateTable;
use controller_lib::supervisor::{FleetSupervisor, LeaseRegistry, SupervisorContext};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting pipeline-controller");

    // Load configuration
    let config = config::ControllerConfig::load()?;
    info!(controller_id = %config.controller_id, "Controller configured");

    let metrics = ControllerMetrics::new();
    let logger = StructuredLogger::new(&config.controller_id);
    logger.log_startup(CONTROLLER_VERSION);

    // Shared collaborators
    let state_table = StateTable::new();
    let rollout = RolloutTracker::new();
    let distributor = Arc::new(ConfigDistributor::new());
    let probe = Arc::new(TcpSinkProbe);

    let supervisor_ctx = SupervisorContext {
        state: state_table.clone(),
        leases: LeaseRegistry::new(),
        rollout: rollout.clone(),
        runner: Arc::new(CommandRunner::new(&config.collector_program, vec![])),
        logger: logger.clone(),
        metrics: metrics.clone(),
    };

    let fleet = Arc::new(FleetSupervisor::new(
        supervisor_ctx,
        config.supervisor(),
        distributor.subscribe_collector(),
    ));

    let estimation = Arc::new(EstimationManager::new(
        config.estimation(),
        state_table.clone(),
        Arc::new(CommandRunner::new(&config.estimation_program, vec![])),
        probe.clone(),
        logger.clone(),
        metrics.clone(),
    ));

    let health = Arc::new(HealthMonitor::new(
        config.health(),
        state_table.clone(),
        probe,
        metrics.clone(),
    ));

    // Supervision tasks
    let (shutdown_tx, _) = broadcast::channel(1);
    let (events_tx, events_rx) = mpsc::channel(64);

    let fleet_handle = tokio::spawn(Arc::clone(&fleet).run(events_rx, shutdown_tx.subscribe()));
    let estimation_handle = tokio::spawn(
        Arc::clone(&estimation).run(distributor.subscribe_estimation(), shutdown_tx.subscribe()),
    );
    let health_handle = tokio::spawn(Arc::clone(&health).run(shutdown_tx.subscribe()));

    // Control surface
    let app_state = Arc::new(api::AppState {
        distributor,
        health,
        fleet,
        estimation,
        state_table,
        rollout,
        events_tx,
        logger: logger.clone(),
        metrics,
    });
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    let _ = shutdown_tx.send(());
    let _ = fleet_handle.await;
    let _ = estimation_handle.await;
    let _ = health_handle.await;
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}
