//! HTTP control surface: health checks, Prometheus metrics, and the
//! deploy/undeploy/status API consumed by the `ppc` CLI.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use controller_lib::distributor::{keys, ConfigDistributor};
use controller_lib::error::PipelineError;
use controller_lib::estimation::EstimationManager;
use controller_lib::health::{HealthMonitor, PipelineStatus, StatusReport};
use controller_lib::models::{CollectorConfig, EstimationServiceSpec};
use controller_lib::observability::{ControllerMetrics, StructuredLogger};
use controller_lib::rollout::{RolloutState, RolloutTracker};
use controller_lib::sink::parse_sink_uri;
use controller_lib::state::StateTable;
use controller_lib::supervisor::{FleetSupervisor, NodeEvent};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub distributor: Arc<ConfigDistributor>,
    pub health: Arc<HealthMonitor>,
    pub fleet: Arc<FleetSupervisor>,
    pub estimation: Arc<EstimationManager>,
    pub state_table: StateTable,
    pub rollout: RolloutTracker,
    pub events_tx: mpsc::Sender<NodeEvent>,
    pub logger: StructuredLogger,
    pub metrics: ControllerMetrics,
}

/// Deploy request carrying both pipeline configurations and the node set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub collector: CollectorConfig,
    pub estimation: EstimationServiceSpec,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResponse {
    pub collector_hash: String,
    pub estimation_hash: String,
    pub nodes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndeployResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub report: StatusReport,
    pub rollout: RolloutState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub entity_id: String,
    #[serde(flatten)]
    pub record: controller_lib::state::EntityRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(e: &PipelineError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match e {
        PipelineError::Validation(_) | PipelineError::UnsupportedSink(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

/// Controller process liveness
async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Pipeline readiness - 200 only when the aggregate is `Ready`
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.health.current().await;

    let status_code = if report.status == PipelineStatus::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(report))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Aggregate status plus per-component and rollout detail
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.health.current().await;
    let rollout = state.rollout.state().await;

    Json(StatusResponse { report, rollout })
}

/// Per-node fleet detail
async fn nodes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut entries: Vec<NodeEntry> = state
        .state_table
        .snapshot()
        .into_iter()
        .map(|(entity_id, record)| NodeEntry { entity_id, record })
        .collect();
    entries.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

    Json(NodesResponse { nodes: entries })
}

/// Deploy the pipeline: publish both configurations, point the health
/// monitor at the storage backend, and bring the node set under
/// supervision.
async fn deploy(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeployRequest>,
) -> impl IntoResponse {
    let collector_hash = match state.distributor.publish_collector(request.collector.clone()) {
        Ok(outcome) => {
            state.metrics.inc_config_publishes(keys::COLLECTOR);
            state
                .logger
                .log_publish(keys::COLLECTOR, &outcome.hash, outcome.version);
            outcome.hash
        }
        // Re-submitting an unchanged document is fine on deploy
        Err(PipelineError::NoOp(hash)) => {
            state.metrics.inc_config_noops(keys::COLLECTOR);
            hash
        }
        Err(e) => return error_response(&e).into_response(),
    };

    let estimation_hash = match state.distributor.publish_estimation(request.estimation) {
        Ok(outcome) => {
            state.metrics.inc_config_publishes(keys::ESTIMATION);
            state
                .logger
                .log_publish(keys::ESTIMATION, &outcome.hash, outcome.version);
            outcome.hash
        }
        Err(PipelineError::NoOp(hash)) => {
            state.metrics.inc_config_noops(keys::ESTIMATION);
            hash
        }
        Err(e) => return error_response(&e).into_response(),
    };

    // The collector sink is the pipeline's storage backend; the health
    // monitor probes it from now on.
    match parse_sink_uri(&request.collector.sink.uri) {
        Ok(parsed) => state.health.set_storage_sink(Some(parsed)).await,
        Err(e) => return error_response(&e).into_response(),
    }

    for node_id in &request.nodes {
        let event = NodeEvent::Joined {
            node_id: node_id.clone(),
        };
        if state.events_tx.send(event).await.is_err() {
            warn!(node_id = %node_id, "Fleet supervisor is not consuming node events");
        }
    }

    state.estimation.set_active(true);

    info!(
        collector_hash = %collector_hash,
        estimation_hash = %estimation_hash,
        nodes = request.nodes.len(),
        "Pipeline deployed"
    );

    Json(DeployResponse {
        collector_hash,
        estimation_hash,
        nodes: request.nodes.len(),
    })
    .into_response()
}

/// Tear the pipeline down: drain the estimation pool, terminate the fleet,
/// and stop probing the storage backend.
async fn undeploy(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.logger.log_undeploy();

    state.estimation.set_active(false);
    state.estimation.stop_all().await;
    state.fleet.undeploy_all().await;
    state.health.set_storage_sink(None).await;

    Json(UndeployResponse {
        status: "undeployed".to_string(),
    })
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/status", get(status))
        .route("/api/v1/nodes", get(nodes))
        .route("/api/v1/deploy", post(deploy))
        .route("/api/v1/undeploy", post(undeploy))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
