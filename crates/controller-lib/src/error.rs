//! Error types for the pipeline controller.

use thiserror::Error;

/// Errors produced by the pipeline controller.
///
/// Transient errors are absorbed by the owning supervisor's restart loop and
/// only show up in aggregate health; everything else propagates to the
/// operator-facing status surface.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed input. Reported, never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Submitted configuration hashes to the already-published version.
    #[error("configuration unchanged (hash {0})")]
    NoOp(String),

    /// Sink or process temporarily unreachable. Retried with backoff.
    #[error("temporarily unavailable: {0}")]
    TransientUnavailable(String),

    /// Retry budget exhausted against a sink. Fatal, surfaced.
    #[error("backend unavailable after {attempts} attempts: {message}")]
    BackendUnavailable { attempts: u32, message: String },

    /// Unknown sink scheme. Fatal, surfaced immediately, no retry.
    #[error("unsupported sink scheme: {0}")]
    UnsupportedSink(String),

    /// A live agent already holds the lease for this node.
    #[error("lease for node {0} is already held")]
    LeaseHeld(String),

    #[error("secret {0} not found")]
    SecretNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// True for errors the supervisor restart loop absorbs.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientUnavailable(_))
    }

    /// True for errors that must reach the operator without retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::BackendUnavailable { .. } | PipelineError::UnsupportedSink(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
