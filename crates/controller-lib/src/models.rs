//! Core data models for the pipeline controller

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reference to a credential held by the secret store collaborator.
///
/// Credentials are resolved at runtime and never embedded in validated
/// configuration documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsRef {
    pub secret_name: String,
}

/// A named destination/source for report data.
///
/// Owned by the Config Distributor; the collector fleet and the estimation
/// service hold it by reference inside their specs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkDescriptor {
    /// Connection URI, `scheme://host[:port]/database`. Userinfo is
    /// rejected at validation time.
    pub uri: String,
    /// Target database name.
    pub database: String,
    /// Target collection within the database.
    pub collection: String,
    /// Credential reference resolved from the secret store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialsRef>,
}

/// Fleet-wide collector configuration submitted to the Config Distributor.
///
/// Node identity is injected per node by the supervisor, producing a
/// [`NodeAgentSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Sampling frequency in hertz. Must be positive.
    pub sampling_frequency_hz: u64,
    /// System-level event counters (e.g. package energy counters).
    #[serde(default)]
    pub system_events: Vec<String>,
    /// Per-container event counters.
    #[serde(default)]
    pub container_events: Vec<String>,
    /// Output sink for raw measurement reports.
    pub sink: SinkDescriptor,
}

/// Per-node collector agent specification.
///
/// Created when a node joins the cluster, destroyed when it leaves.
/// Event-set updates arrive as a new config hash and require a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAgentSpec {
    pub node_id: String,
    pub sampling_frequency_hz: u64,
    pub system_events: Vec<String>,
    pub container_events: Vec<String>,
    pub sink: SinkDescriptor,
}

impl NodeAgentSpec {
    /// Instantiate a node agent spec from the fleet-wide config.
    pub fn from_config(node_id: impl Into<String>, config: &CollectorConfig) -> Self {
        Self {
            node_id: node_id.into(),
            sampling_frequency_hz: config.sampling_frequency_hz,
            system_events: config.system_events.clone(),
            container_events: config.container_events.clone(),
            sink: config.sink.clone(),
        }
    }
}

/// Calibration parameters tuning the estimation formula's sensitivity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationParams {
    /// Base (nominal) CPU frequency in MHz.
    pub base_frequency_mhz: u64,
    /// Minimum CPU frequency in MHz.
    pub min_frequency_mhz: u64,
    /// Maximum (turbo) CPU frequency in MHz.
    pub max_frequency_mhz: u64,
    /// Thermal design power in watts.
    pub tdp_watts: f64,
    /// Error threshold in watts before the model is re-learned.
    pub error_threshold_watts: f64,
    /// Reference energy event the formula calibrates against.
    pub reference_event: String,
    /// Minimum samples required before a power model is learned.
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
    /// History window of samples kept for learning.
    #[serde(default = "default_history_window")]
    pub history_window: u32,
    /// Produce estimates for incomplete windows.
    #[serde(default)]
    pub real_time_mode: bool,
}

fn default_min_samples() -> u32 {
    10
}

fn default_history_window() -> u32 {
    60
}

/// Estimation service configuration submitted to the Config Distributor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimationServiceSpec {
    /// Input sink holding raw measurement reports.
    pub input: SinkDescriptor,
    /// Output sinks for derived power reports. At most one unless
    /// `multiplex` is set.
    pub outputs: Vec<SinkDescriptor>,
    /// Allow more than one output sink.
    #[serde(default)]
    pub multiplex: bool,
    pub calibration: CalibrationParams,
    /// Interval between report batches in milliseconds.
    pub sampling_interval_ms: u64,
}

impl EstimationServiceSpec {
    /// The sink the estimation process writes derived reports to.
    ///
    /// With multiplexing enabled only the first output is wired to the
    /// managed process; the remainder are validated for future use.
    pub fn primary_output(&self) -> Option<&SinkDescriptor> {
        self.outputs.first()
    }
}

/// Raw measurement report produced by a sensor collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawReport {
    pub timestamp: i64,
    pub node_id: String,
    pub target_id: String,
    pub counters: HashMap<String, u64>,
}

/// Derived power report produced by the estimation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerReport {
    pub timestamp: i64,
    pub node_id: String,
    pub target_id: String,
    pub power_watts: f64,
    #[serde(default)]
    pub formula_metadata: HashMap<String, serde_json::Value>,
}
