//! Shared per-entity state table
//!
//! Every supervised entity (node agent, estimation instance) publishes its
//! lifecycle state here. Writers take the exclusive per-entity lock of the
//! sharded map; the health monitor reads cloned snapshots and never holds an
//! entity lock across an await point.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Lifecycle of a supervised entity.
///
/// `Degraded` is reachable only after the consecutive-failure cap is
/// exceeded. `Terminated` is reachable from any state on node-leave or
/// undeploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Starting,
    Running,
    CrashLoop,
    Degraded,
    Terminated,
}

impl LifecycleState {
    /// Terminal states require external intervention to leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Degraded | LifecycleState::Terminated)
    }
}

/// Kind of supervised entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    NodeAgent,
    EstimationInstance,
}

/// State record for a single supervised entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub kind: EntityKind,
    pub state: LifecycleState,
    pub consecutive_failures: u32,
    pub restarts_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Config hash the entity currently runs with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_hash: Option<String>,
    pub updated_at: i64,
}

impl EntityRecord {
    fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            state: LifecycleState::Pending,
            consecutive_failures: 0,
            restarts_total: 0,
            last_error: None,
            applied_hash: None,
            updated_at: Utc::now().timestamp(),
        }
    }
}

/// Sharded table of entity state records.
#[derive(Clone, Default)]
pub struct StateTable {
    entries: Arc<DashMap<String, EntityRecord>>,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity in `Pending` state. Idempotent.
    pub fn register(&self, entity_id: &str, kind: EntityKind) {
        self.entries
            .entry(entity_id.to_string())
            .or_insert_with(|| EntityRecord::new(kind));
    }

    /// Transition an entity to a new state.
    pub fn set_state(&self, entity_id: &str, state: LifecycleState) {
        if let Some(mut entry) = self.entries.get_mut(entity_id) {
            entry.state = state;
            entry.updated_at = Utc::now().timestamp();
        }
    }

    /// Record a failure, returning the new consecutive-failure count.
    ///
    /// Every failure lands here so no error is ever silently dropped.
    pub fn record_failure(&self, entity_id: &str, error: impl Into<String>) -> u32 {
        match self.entries.get_mut(entity_id) {
            Some(mut entry) => {
                entry.consecutive_failures += 1;
                entry.last_error = Some(error.into());
                entry.updated_at = Utc::now().timestamp();
                entry.consecutive_failures
            }
            None => 0,
        }
    }

    /// Record a successful (re)start: clears the failure streak.
    pub fn record_started(&self, entity_id: &str, applied_hash: Option<String>) {
        if let Some(mut entry) = self.entries.get_mut(entity_id) {
            entry.state = LifecycleState::Running;
            entry.consecutive_failures = 0;
            entry.last_error = None;
            entry.restarts_total += 1;
            entry.applied_hash = applied_hash;
            entry.updated_at = Utc::now().timestamp();
        }
    }

    /// Remove an entity from the table.
    pub fn remove(&self, entity_id: &str) -> Option<EntityRecord> {
        self.entries.remove(entity_id).map(|(_, v)| v)
    }

    pub fn get(&self, entity_id: &str) -> Option<EntityRecord> {
        self.entries.get(entity_id).map(|r| r.clone())
    }

    /// Consistent point-in-time snapshot of all entities.
    pub fn snapshot(&self) -> Vec<(String, EntityRecord)> {
        self.entries
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    /// Count entities of a kind in a given state.
    pub fn count_in_state(&self, kind: EntityKind, state: LifecycleState) -> usize {
        self.entries
            .iter()
            .filter(|r| r.kind == kind && r.state == state)
            .count()
    }

    /// Fraction of non-terminated entities of a kind that are `Running`.
    ///
    /// Returns 1.0 for an empty fleet so an undeployed pipeline does not
    /// read as a failed rollout.
    pub fn readiness(&self, kind: EntityKind) -> f64 {
        let mut total = 0usize;
        let mut running = 0usize;

        for r in self.entries.iter() {
            if r.kind != kind || r.state == LifecycleState::Terminated {
                continue;
            }
            total += 1;
            if r.state == LifecycleState::Running {
                running += 1;
            }
        }

        if total == 0 {
            1.0
        } else {
            running as f64 / total as f64
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_transition() {
        let table = StateTable::new();
        table.register("node-1", EntityKind::NodeAgent);

        let record = table.get("node-1").unwrap();
        assert_eq!(record.state, LifecycleState::Pending);

        table.set_state("node-1", LifecycleState::Starting);
        assert_eq!(table.get("node-1").unwrap().state, LifecycleState::Starting);
    }

    #[test]
    fn test_register_is_idempotent() {
        let table = StateTable::new();
        table.register("node-1", EntityKind::NodeAgent);
        table.set_state("node-1", LifecycleState::Running);

        // Re-registering must not reset state
        table.register("node-1", EntityKind::NodeAgent);
        assert_eq!(table.get("node-1").unwrap().state, LifecycleState::Running);
    }

    #[test]
    fn test_failure_streak_and_reset() {
        let table = StateTable::new();
        table.register("node-1", EntityKind::NodeAgent);

        assert_eq!(table.record_failure("node-1", "agent crashed"), 1);
        assert_eq!(table.record_failure("node-1", "agent crashed"), 2);

        table.record_started("node-1", Some("abc123".to_string()));
        let record = table.get("node-1").unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert!(record.last_error.is_none());
        assert_eq!(record.applied_hash.as_deref(), Some("abc123"));
        assert_eq!(record.restarts_total, 1);
    }

    #[test]
    fn test_readiness_fraction() {
        let table = StateTable::new();
        for i in 0..10 {
            let id = format!("node-{i}");
            table.register(&id, EntityKind::NodeAgent);
            if i < 7 {
                table.set_state(&id, LifecycleState::Running);
            } else {
                table.set_state(&id, LifecycleState::Degraded);
            }
        }

        let readiness = table.readiness(EntityKind::NodeAgent);
        assert!((readiness - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn test_readiness_ignores_terminated() {
        let table = StateTable::new();
        table.register("node-1", EntityKind::NodeAgent);
        table.set_state("node-1", LifecycleState::Running);
        table.register("node-2", EntityKind::NodeAgent);
        table.set_state("node-2", LifecycleState::Terminated);

        assert!((table.readiness(EntityKind::NodeAgent) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_readiness_empty_fleet() {
        let table = StateTable::new();
        assert!((table.readiness(EntityKind::NodeAgent) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_terminal_states() {
        assert!(LifecycleState::Degraded.is_terminal());
        assert!(LifecycleState::Terminated.is_terminal());
        assert!(!LifecycleState::CrashLoop.is_terminal());
    }
}
