//! Progress events emitted by the pipeline and consumed by the client.
//!
//! Wire shape of one frame:
//!
//! ```text
//! { "type": "<kind>", "timestamp": "<rfc3339>"?, "data": { ...kind specific... } }
//! ```
//!
//! Decoding is per-frame and fallible; an unknown `type` decodes to
//! [`EventBody::Unrecognized`] rather than failing, while malformed JSON or a
//! known type with the wrong `data` shape yields a [`FrameError`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::id::CorrelationId;

/// Where a stage retry's wait time came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitSource {
    /// The upstream error said how long to wait.
    Upstream,
    /// Policy default; the upstream gave no hint.
    Fallback,
}

/// Payload of `quota_exhausted_retry` and `rate_limit_retry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryEventPayload {
    pub agent_name: String,
    /// One-based attempt that just failed.
    pub attempt: u32,
    pub max_attempts: u32,
    pub wait_source: WaitSource,
    /// Wait before jitter, in seconds.
    pub wait_seconds: f64,
    pub jitter_seconds: f64,
    /// `wait_seconds + jitter_seconds`.
    pub total_wait_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RetryEventPayload {
    pub fn new(
        agent_name: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
        wait: Duration,
        wait_source: WaitSource,
        jitter: Duration,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            attempt,
            max_attempts,
            wait_source,
            wait_seconds: seconds(wait),
            jitter_seconds: seconds(jitter),
            total_wait_seconds: seconds(wait.saturating_add(jitter)),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Total wait as a duration (millisecond precision).
    pub fn total_wait(&self) -> Duration {
        Duration::from_millis((self.total_wait_seconds.max(0.0) * 1000.0).round() as u64)
    }

    fn validate(&self) -> Result<(), String> {
        if self.attempt == 0 || self.attempt > self.max_attempts {
            return Err(format!(
                "attempt {} outside 1..={}",
                self.attempt, self.max_attempts
            ));
        }
        if self.wait_seconds < 0.0 || self.jitter_seconds < 0.0 || self.total_wait_seconds < 0.0 {
            return Err("negative wait".to_string());
        }
        Ok(())
    }
}

/// Millisecond-rounded seconds, so `20s + 1.4s` reads back as exactly `21.4`.
fn seconds(d: Duration) -> f64 {
    d.as_millis() as f64 / 1000.0
}

/// The seven event kinds, each with only the fields relevant to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventBody {
    Connected {
        correlation_id: CorrelationId,
    },
    AuditStarted {
        target: String,
        #[serde(default)]
        stages: Vec<String>,
    },
    QuotaExhaustedRetry(RetryEventPayload),
    RateLimitRetry(RetryEventPayload),
    RetryComplete {
        agent_name: String,
        attempts: u32,
    },
    AuditCompleted {
        result: JsonValue,
    },
    AuditError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_name: Option<String>,
        message: String,
    },
    /// A `type` this build does not know. Kept, not dropped.
    #[serde(skip)]
    Unrecognized { kind: String, data: JsonValue },
}

const KNOWN_KINDS: [&str; 7] = [
    "connected",
    "audit_started",
    "quota_exhausted_retry",
    "rate_limit_retry",
    "retry_complete",
    "audit_completed",
    "audit_error",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<JsonValue>,
    #[serde(default)]
    data: JsonValue,
}

/// One decoded progress frame. Never mutated after receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub timestamp: Option<DateTime<Utc>>,
    pub body: EventBody,
}

impl ProgressEvent {
    /// Stamp a body with the current time.
    pub fn now(body: EventBody) -> Self {
        Self {
            timestamp: Some(Utc::now()),
            body,
        }
    }

    /// Wire name of this event's kind.
    pub fn kind(&self) -> &str {
        match &self.body {
            EventBody::Connected { .. } => "connected",
            EventBody::AuditStarted { .. } => "audit_started",
            EventBody::QuotaExhaustedRetry(_) => "quota_exhausted_retry",
            EventBody::RateLimitRetry(_) => "rate_limit_retry",
            EventBody::RetryComplete { .. } => "retry_complete",
            EventBody::AuditCompleted { .. } => "audit_completed",
            EventBody::AuditError { .. } => "audit_error",
            EventBody::Unrecognized { kind, .. } => kind,
        }
    }

    /// `audit_completed` and `audit_error` end a job's event sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.body,
            EventBody::AuditCompleted { .. } | EventBody::AuditError { .. }
        )
    }

    pub fn retry_payload(&self) -> Option<&RetryEventPayload> {
        match &self.body {
            EventBody::QuotaExhaustedRetry(p) | EventBody::RateLimitRetry(p) => Some(p),
            _ => None,
        }
    }

    /// Decode one frame's data.
    pub fn decode(frame: &str) -> Result<Self, FrameError> {
        let wire: WireFrame =
            serde_json::from_str(frame).map_err(|e| FrameError::Malformed(e.to_string()))?;

        let timestamp = wire
            .timestamp
            .as_ref()
            .and_then(JsonValue::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        if !KNOWN_KINDS.contains(&wire.kind.as_str()) {
            return Ok(Self {
                timestamp,
                body: EventBody::Unrecognized {
                    kind: wire.kind,
                    data: wire.data,
                },
            });
        }

        let tagged = serde_json::json!({ "type": wire.kind, "data": wire.data });
        let body: EventBody =
            serde_json::from_value(tagged).map_err(|e| FrameError::InvalidPayload {
                kind: wire.kind.clone(),
                reason: e.to_string(),
            })?;

        if let EventBody::QuotaExhaustedRetry(p) | EventBody::RateLimitRetry(p) = &body {
            p.validate().map_err(|reason| FrameError::InvalidPayload {
                kind: wire.kind.clone(),
                reason,
            })?;
        }

        Ok(Self { timestamp, body })
    }

    /// Encode as one frame's data.
    pub fn to_frame(&self) -> String {
        let timestamp = self
            .timestamp
            .map(|t| JsonValue::String(t.to_rfc3339()));

        let wire = match &self.body {
            EventBody::Unrecognized { kind, data } => WireFrame {
                kind: kind.clone(),
                timestamp,
                data: data.clone(),
            },
            body => {
                let mut tagged = serde_json::to_value(body).unwrap_or(JsonValue::Null);
                WireFrame {
                    kind: self.kind().to_string(),
                    timestamp,
                    data: tagged
                        .get_mut("data")
                        .map(JsonValue::take)
                        .unwrap_or(JsonValue::Null),
                }
            }
        };

        serde_json::to_string(&wire).unwrap_or_else(|_| "{}".to_string())
    }

    /// Human-readable one-liner for activity logs.
    pub fn describe(&self) -> String {
        match &self.body {
            EventBody::Connected { correlation_id } => {
                format!("progress channel connected ({correlation_id})")
            }
            EventBody::AuditStarted { target, stages } => {
                format!("audit started for {target} ({} stages)", stages.len())
            }
            EventBody::QuotaExhaustedRetry(p) => format!(
                "{}: quota exhausted on attempt {}/{}, retrying in {:.1}s ({} wait)",
                p.agent_name,
                p.attempt,
                p.max_attempts,
                p.total_wait_seconds,
                wait_source_label(p.wait_source),
            ),
            EventBody::RateLimitRetry(p) => format!(
                "{}: rate limited on attempt {}/{}, retrying in {:.1}s ({} wait)",
                p.agent_name,
                p.attempt,
                p.max_attempts,
                p.total_wait_seconds,
                wait_source_label(p.wait_source),
            ),
            EventBody::RetryComplete {
                agent_name,
                attempts,
            } => format!("{agent_name}: recovered after {attempts} attempts"),
            EventBody::AuditCompleted { .. } => "audit completed".to_string(),
            EventBody::AuditError {
                agent_name: Some(agent),
                message,
            } => format!("audit failed in {agent}: {message}"),
            EventBody::AuditError {
                agent_name: None,
                message,
            } => format!("audit failed: {message}"),
            EventBody::Unrecognized { kind, .. } => format!("unrecognized event '{kind}'"),
        }
    }
}

fn wait_source_label(source: WaitSource) -> &'static str {
    match source {
        WaitSource::Upstream => "upstream-provided",
        WaitSource::Fallback => "fallback",
    }
}
