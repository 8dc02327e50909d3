//! The backend seam: what the client needs from the audit service.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use auditrelay_core::{AuditError, CorrelationId};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::sse::SseFrame;

/// Raw frames of one progress channel. `Err` items are channel-level errors.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SseFrame, TransportError>> + Send>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No response at all.
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Response with a failure status.
    #[error("HTTP {status} {code}: {message}")]
    Http {
        status: u16,
        code: String,
        message: String,
        agent: Option<String>,
    },

    /// Success status, unreadable body.
    #[error("invalid response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Connection failures and timeouts; never application-level rejections.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unreachable(_) | TransportError::Timeout(_))
    }

    pub fn into_audit_error(self) -> AuditError {
        match self {
            TransportError::Unreachable(msg) => AuditError::Unreachable(msg),
            TransportError::Timeout(d) => AuditError::Timeout {
                seconds: d.as_secs(),
            },
            TransportError::Http {
                code,
                message,
                agent,
                ..
            } if code == "upstream_fatal" => AuditError::UpstreamFatal {
                agent: agent.unwrap_or_default(),
                message,
            },
            TransportError::Http {
                status,
                code,
                message,
                ..
            } => AuditError::Http {
                status,
                code,
                message,
            },
            TransportError::Decode(msg) => AuditError::Http {
                status: 200,
                code: "invalid_response".to_string(),
                message: msg,
            },
        }
    }
}

/// Answer of the liveness endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub status: u16,
    pub healthy: bool,
    pub detail: Option<String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            status: 200,
            healthy: true,
            detail: None,
        }
    }

    pub fn unhealthy(status: u16, detail: impl Into<String>) -> Self {
        Self {
            status,
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub target: String,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    /// Present when the backend echoes or reassigns the id.
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    pub result: JsonValue,
}

/// Liveness, submission and progress channel of the audit service.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn check_health(&self, timeout: Duration) -> Result<HealthReport, TransportError>;

    async fn submit(
        &self,
        request: &SubmitRequest,
        timeout: Duration,
    ) -> Result<SubmitResponse, TransportError>;

    /// Open the progress channel for `correlation_id`. No overall timeout.
    async fn open_stream(&self, correlation_id: &CorrelationId) -> Result<FrameStream, TransportError>;
}
