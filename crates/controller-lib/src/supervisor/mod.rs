//! Node agent supervision
//!
//! This module keeps exactly one collector agent alive per cluster node:
//! per-node leases guarantee at-most-one live instance, crashes restart
//! with capped exponential backoff, and nodes that exceed the
//! consecutive-failure cap are reported as degraded instead of being
//! retried forever.

mod agent;
mod backoff;
mod fleet;
mod lease;

#[cfg(test)]
mod tests;

pub use agent::{supervise_node_agent, SupervisorConfig, SupervisorContext};
pub use backoff::{BackoffConfig, RestartBackoff};
pub use fleet::{FleetSupervisor, NodeEvent};
pub use lease::{LeaseRegistry, NodeLease};
