//! Controller configuration

use anyhow::Result;
use controller_lib::estimation::EstimationManagerConfig;
use controller_lib::health::HealthMonitorConfig;
use controller_lib::supervisor::{BackoffConfig, SupervisorConfig};
use serde::Deserialize;
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Controller identity used in structured log events
    #[serde(default = "default_controller_id")]
    pub controller_id: String,

    /// API server port for health/status/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Fraction of nodes that must be running for the fleet to be ready
    #[serde(default = "default_readiness_threshold")]
    pub readiness_threshold: f64,

    /// Consecutive failures before an entity is marked degraded
    #[serde(default = "default_failure_cap")]
    pub failure_cap: u32,

    /// Base restart backoff in seconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// Restart backoff cap in seconds
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,

    /// Sink reachability probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Process start/stop deadline in seconds
    #[serde(default = "default_process_timeout")]
    pub process_timeout_secs: u64,

    /// Health polling interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Estimation instance pool size
    #[serde(default = "default_pool_size")]
    pub estimation_pool_size: usize,

    /// Binary launched per node for the sensor collector
    #[serde(default = "default_collector_program")]
    pub collector_program: String,

    /// Binary launched for the estimation formula
    #[serde(default = "default_estimation_program")]
    pub estimation_program: String,
}

fn default_controller_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "pipeline-controller-0".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_readiness_threshold() -> f64 {
    1.0
}

fn default_failure_cap() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    1
}

fn default_backoff_cap() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_process_timeout() -> u64 {
    15
}

fn default_poll_interval() -> u64 {
    10
}

fn default_pool_size() -> usize {
    1
}

fn default_collector_program() -> String {
    "hwpc-sensor".to_string()
}

fn default_estimation_program() -> String {
    "smartwatts-formula".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_id: default_controller_id(),
            api_port: default_api_port(),
            readiness_threshold: default_readiness_threshold(),
            failure_cap: default_failure_cap(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            probe_timeout_secs: default_probe_timeout(),
            process_timeout_secs: default_process_timeout(),
            poll_interval_secs: default_poll_interval(),
            estimation_pool_size: default_pool_size(),
            collector_program: default_collector_program(),
            estimation_program: default_estimation_program(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from `CONTROLLER_`-prefixed environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("CONTROLLER"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }

    fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_secs(self.backoff_base_secs),
            cap: Duration::from_secs(self.backoff_cap_secs),
            ..BackoffConfig::default()
        }
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            backoff: self.backoff(),
            failure_cap: self.failure_cap,
            start_timeout: Duration::from_secs(self.process_timeout_secs),
            stop_timeout: Duration::from_secs(self.process_timeout_secs),
            ..SupervisorConfig::default()
        }
    }

    pub fn estimation(&self) -> EstimationManagerConfig {
        EstimationManagerConfig {
            pool_size: self.estimation_pool_size,
            backoff: self.backoff(),
            failure_cap: self.failure_cap,
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            start_timeout: Duration::from_secs(self.process_timeout_secs),
            drain_timeout: Duration::from_secs(self.process_timeout_secs),
            ..EstimationManagerConfig::default()
        }
    }

    pub fn health(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            readiness_threshold: self.readiness_threshold,
        }
    }
}
