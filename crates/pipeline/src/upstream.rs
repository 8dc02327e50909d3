//! Upstream (model provider) failure classification.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

/// A failed upstream call, classified by whether the stage may retry it.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UpstreamError {
    /// Quota used up; recoverable after waiting.
    #[error("quota exhausted: {message}")]
    QuotaExhausted {
        retry_after: Option<Duration>,
        message: String,
    },

    /// Throttled or temporarily overloaded; recoverable after waiting.
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    /// Not worth retrying.
    #[error("{message}")]
    Fatal { message: String },
}

fn retry_hint() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"retry in (\d+(?:\.\d+)?)").expect("retry hint pattern is valid")
    })
}

impl UpstreamError {
    /// Classify a raw provider error message.
    ///
    /// Quota markers win over `429`; a `retry in <secs>` hint anywhere in
    /// the message becomes `retry_after`.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let retry_after = parse_retry_hint(&lower);

        let quota = lower.contains("resource_exhausted")
            || lower.contains("quota exceeded")
            || lower.contains("current quota");
        if quota {
            return Self::QuotaExhausted {
                retry_after,
                message,
            };
        }

        let throttled = lower.contains("429")
            || lower.contains("503")
            || lower.contains("overloaded")
            || lower.contains("unavailable");
        if throttled {
            return Self::RateLimited {
                retry_after,
                message,
            };
        }

        Self::Fatal { message }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, UpstreamError::Fatal { .. })
    }

    /// Wait the upstream asked for, if it said.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            UpstreamError::QuotaExhausted { retry_after, .. }
            | UpstreamError::RateLimited { retry_after, .. } => *retry_after,
            UpstreamError::Fatal { .. } => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            UpstreamError::QuotaExhausted { message, .. }
            | UpstreamError::RateLimited { message, .. }
            | UpstreamError::Fatal { message } => message,
        }
    }
}

fn parse_retry_hint(lower: &str) -> Option<Duration> {
    let caps = retry_hint().captures(lower)?;
    let secs: f64 = caps.get(1)?.as_str().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_millis((secs * 1000.0).round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_messages_with_hint() {
        let err = UpstreamError::classify(
            "429 RESOURCE_EXHAUSTED. You exceeded your current quota. Please retry in 20.5s.",
        );
        assert!(matches!(err, UpstreamError::QuotaExhausted { .. }));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(20_500)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn bare_429_is_rate_limit_without_hint() {
        let err = UpstreamError::classify("HTTP 429 Too Many Requests");
        assert!(matches!(err, UpstreamError::RateLimited { retry_after: None, .. }));
    }

    #[test]
    fn overload_counts_as_rate_limit() {
        assert!(matches!(
            UpstreamError::classify("503 model is overloaded"),
            UpstreamError::RateLimited { .. }
        ));
        assert!(matches!(
            UpstreamError::classify("service UNAVAILABLE, retry in 3"),
            UpstreamError::RateLimited { retry_after: Some(d), .. } if d == Duration::from_secs(3)
        ));
    }

    #[test]
    fn anything_else_is_fatal() {
        let err = UpstreamError::classify("invalid schema in response");
        assert!(!err.is_recoverable());
        assert_eq!(err.retry_after(), None);
        assert_eq!(err.message(), "invalid schema in response");
    }
}
