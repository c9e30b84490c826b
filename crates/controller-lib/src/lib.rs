//! Controller library for sensor-to-estimation power pipelines
//!
//! This crate provides the core functionality for:
//! - Configuration validation, hashing, and distribution
//! - Per-node collector agent supervision with leases and backoff
//! - Estimation service lifecycle management
//! - Pipeline health aggregation
//! - Observability (metrics and structured logging)

pub mod distributor;
pub mod error;
pub mod estimation;
pub mod health;
pub mod models;
pub mod observability;
pub mod rollout;
pub mod runner;
pub mod sink;
pub mod state;
pub mod supervisor;

pub use error::{PipelineError, Result};
pub use health::{
    ComponentDetail, FleetDetail, HealthMonitor, HealthMonitorConfig, PipelineStatus, StatusReport,
};
pub use models::*;
pub use observability::{ControllerMetrics, StructuredLogger};
pub use state::{EntityKind, EntityRecord, LifecycleState, StateTable};
