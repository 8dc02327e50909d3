//! Readiness probe records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classified result of one liveness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// Healthy status within the timeout.
    Success,
    /// Reachable, but reported a failure status or a non-healthy body.
    HttpError {
        status: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Connection refused, reset, DNS failure.
    NetworkError { message: String },
    /// No answer within the per-attempt timeout.
    Timeout,
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success)
    }

    /// Reached the backend, but it is not ready.
    pub fn is_soft_failure(&self) -> bool {
        matches!(self, ProbeOutcome::HttpError { .. })
    }

    pub fn label(&self) -> String {
        match self {
            ProbeOutcome::Success => "healthy".to_string(),
            ProbeOutcome::HttpError {
                status,
                detail: Some(detail),
            } => format!("not ready (HTTP {status}: {detail})"),
            ProbeOutcome::HttpError { status, detail: None } => format!("not ready (HTTP {status})"),
            ProbeOutcome::NetworkError { message } => format!("unreachable ({message})"),
            ProbeOutcome::Timeout => "timed out".to_string(),
        }
    }
}

/// One liveness check. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeAttempt {
    /// One-based, strictly increasing within a probing run.
    pub sequence: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: ProbeOutcome,
    pub latency: Duration,
}
