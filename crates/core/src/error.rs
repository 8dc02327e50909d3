//! Audit error model.

use thiserror::Error;

use crate::job::JobStatus;

/// Result type used across the audit relay.
pub type AuditResult<T> = Result<T, AuditError>;

/// Classified failure surfaced to the caller of an audit.
///
/// Frame-level parse failures are deliberately absent: they are logged and
/// dropped by the stream consumer and never reach the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuditError {
    /// The target was empty or degenerate; rejected before any network IO.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// No response from the backend (connection refused, DNS, reset).
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// No response within the bound.
    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The backend answered with a failure status.
    #[error("backend rejected request ({status} {code}): {message}")]
    Http {
        status: u16,
        code: String,
        message: String,
    },

    /// A pipeline stage exhausted its retry bound (or hit a fatal upstream error).
    #[error("stage {agent} failed: {message}")]
    UpstreamFatal { agent: String, message: String },

    /// The progress channel could not be managed (e.g. a second consumer for the same id).
    #[error("progress stream error: {0}")]
    Stream(String),

    /// The caller abandoned the job.
    #[error("audit cancelled")]
    Cancelled,

    /// A job status transition broke the lifecycle rules.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

impl AuditError {
    pub fn invalid_target(msg: impl Into<String>) -> Self {
        Self::InvalidTarget(msg.into())
    }

    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Transport failures that may clear up once the backend finishes waking.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuditError::Unreachable(_) | AuditError::Timeout { .. })
    }

    /// Short machine-readable code, used in logs and JSON bodies.
    pub fn code(&self) -> &str {
        match self {
            AuditError::InvalidTarget(_) => "invalid_target",
            AuditError::Unreachable(_) => "network_unreachable",
            AuditError::Timeout { .. } => "timeout",
            AuditError::Http { code, .. } => code,
            AuditError::UpstreamFatal { .. } => "upstream_fatal",
            AuditError::Stream(_) => "stream_error",
            AuditError::Cancelled => "cancelled",
            AuditError::InvalidTransition(_) => "invalid_transition",
        }
    }
}

/// Rejected job status change.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot move job from {from:?} to {to:?}")]
    Backwards { from: JobStatus, to: JobStatus },

    #[error("job already reached terminal status {0:?}")]
    Terminal(JobStatus),

    #[error("correlation id was already reconciled once")]
    AlreadyReconciled,
}
