//! Process launch abstraction
//!
//! Supervisors start and stop managed processes (sensor collectors, the
//! estimation service) through the [`ProcessRunner`] trait so tests can
//! substitute scripted implementations. The production implementation
//! spawns child processes with the rendered configuration passed as a JSON
//! argument.

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A request to launch one managed process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Entity name, used for logging and child identification.
    pub name: String,
    /// Rendered configuration document handed to the process.
    pub config: serde_json::Value,
}

/// Handle to a started process.
#[async_trait]
pub trait ProcessHandle: Send + Sync + std::fmt::Debug {
    /// Liveness check. False once the process has exited for any reason.
    async fn is_alive(&self) -> bool;

    /// Stop the process, waiting at most `timeout` for it to exit.
    async fn stop(&self, timeout: Duration) -> Result<()>;
}

/// Starts managed processes.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn start(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>>;
}

/// Runner spawning an external binary per managed entity.
pub struct CommandRunner {
    program: String,
    base_args: Vec<String>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }
}

#[async_trait]
impl ProcessRunner for CommandRunner {
    async fn start(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        let config_json = serde_json::to_string(&spec.config)?;

        let child = Command::new(&self.program)
            .args(&self.base_args)
            .arg("--config-json")
            .arg(&config_json)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PipelineError::TransientUnavailable(format!(
                    "failed to spawn {} for {}: {e}",
                    self.program, spec.name
                ))
            })?;

        debug!(name = %spec.name, program = %self.program, "Spawned managed process");

        Ok(Box::new(CommandHandle {
            name: spec.name.clone(),
            child: Mutex::new(child),
        }))
    }
}

/// Handle over a spawned child process.
#[derive(Debug)]
struct CommandHandle {
    name: String,
    child: Mutex<Child>,
}

#[async_trait]
impl ProcessHandle for CommandHandle {
    async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(name = %self.name, status = %status, "Managed process exited");
                false
            }
            Err(e) => {
                warn!(name = %self.name, error = %e, "Failed to poll managed process");
                false
            }
        }
    }

    async fn stop(&self, timeout: Duration) -> Result<()> {
        let mut child = self.child.lock().await;

        // Already exited?
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }

        child.start_kill().map_err(|e| {
            PipelineError::TransientUnavailable(format!("failed to signal {}: {e}", self.name))
        })?;

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(_status)) => Ok(()),
            Ok(Err(e)) => Err(PipelineError::TransientUnavailable(format!(
                "failed to reap {}: {e}",
                self.name
            ))),
            Err(_) => Err(PipelineError::TransientUnavailable(format!(
                "{} did not exit within {}s",
                self.name,
                timeout.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_command_runner_spawn_and_stop() {
        let runner = CommandRunner::new("sleep", vec!["30".to_string()]);
        let spec = LaunchSpec {
            name: "collector-test".to_string(),
            config: json!({"node_id": "test"}),
        };

        let handle = runner.start(&spec).await.unwrap();
        assert!(handle.is_alive().await);

        handle.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!handle.is_alive().await);
    }

    #[tokio::test]
    async fn test_exited_process_is_not_alive() {
        let runner = CommandRunner::new("true", vec![]);
        let spec = LaunchSpec {
            name: "collector-exits".to_string(),
            config: json!({}),
        };

        let handle = runner.start(&spec).await.unwrap();

        // Give the child a moment to run to completion.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_alive().await);

        // Stopping an exited process is not an error.
        handle.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_program_fails_start() {
        let runner = CommandRunner::new("definitely-not-a-real-binary", vec![]);
        let spec = LaunchSpec {
            name: "collector-missing".to_string(),
            config: json!({}),
        };

        let err = runner.start(&spec).await.unwrap_err();
        assert!(err.is_transient());
    }
}
