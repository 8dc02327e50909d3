use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use auditrelay_core::AuditError;
use auditrelay_pipeline::{PipelineError, UpstreamError};

/// Failures a handler reports to the client.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidTarget(String),

    #[error("{message}")]
    UpstreamFatal { agent: String, message: String },
}

impl From<AuditError> for ApiError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::InvalidTarget(msg) => ApiError::InvalidTarget(msg),
            other => ApiError::UpstreamFatal {
                agent: String::new(),
                message: other.to_string(),
            },
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::StageFailed {
                agent,
                attempts,
                source,
            } => ApiError::UpstreamFatal {
                message: match &source {
                    UpstreamError::Fatal { message } => message.clone(),
                    recoverable => {
                        format!("exhausted {attempts} attempt(s): {}", recoverable.message())
                    }
                },
                agent,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidTarget(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_target", msg),
            ApiError::UpstreamFatal { agent, message } => (
                StatusCode::BAD_GATEWAY,
                axum::Json(json!({
                    "error": "upstream_fatal",
                    "message": message,
                    "agent": agent,
                })),
            )
                .into_response(),
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_stage_maps_to_bad_gateway() {
        let err = ApiError::from(PipelineError::StageFailed {
            agent: "page-inspection".into(),
            attempts: 3,
            source: UpstreamError::classify("429 too many requests"),
        });
        match &err {
            ApiError::UpstreamFatal { agent, message } => {
                assert_eq!(agent, "page-inspection");
                assert!(message.starts_with("exhausted 3 attempt(s)"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
