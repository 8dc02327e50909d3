//! Client settings from the environment.

use std::str::FromStr;
use std::time::Duration;

use auditrelay_core::BackoffPolicy;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub backend_url: String,
    pub probe: BackoffPolicy,
    /// Per liveness check.
    pub probe_timeout: Duration,
    pub submission: BackoffPolicy,
    /// Per submission attempt. Long: the backend answers only when the audit is done.
    pub submit_timeout: Duration,
    /// How long the progress channel outlives the submission response.
    pub stream_grace: Duration,
    pub stream_reconnect: BackoffPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            probe: BackoffPolicy::probing(),
            probe_timeout: Duration::from_secs(5),
            submission: BackoffPolicy::submission(),
            submit_timeout: Duration::from_secs(120),
            stream_grace: Duration::from_millis(2000),
            stream_reconnect: BackoffPolicy::stream_reconnect(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; malformed values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let backend_url = lookup("AUDITRELAY_BACKEND_URL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.backend_url);

        let probe_attempts = parse_or(&lookup, "AUDITRELAY_PROBE_ATTEMPTS", defaults.probe.max_attempts);
        let probe_timeout = parse_or(
            &lookup,
            "AUDITRELAY_PROBE_TIMEOUT_SECS",
            defaults.probe_timeout.as_secs(),
        );
        let submit_attempts = parse_or(
            &lookup,
            "AUDITRELAY_SUBMIT_ATTEMPTS",
            defaults.submission.max_attempts,
        );
        let submit_timeout = parse_or(
            &lookup,
            "AUDITRELAY_SUBMIT_TIMEOUT_SECS",
            defaults.submit_timeout.as_secs(),
        );
        let grace_ms = parse_or(
            &lookup,
            "AUDITRELAY_STREAM_GRACE_MS",
            defaults.stream_grace.as_millis() as u64,
        );

        Self {
            backend_url,
            probe: defaults.probe.with_max_attempts(probe_attempts.max(1)),
            probe_timeout: Duration::from_secs(probe_timeout.max(1)),
            submission: defaults.submission.with_max_attempts(submit_attempts.max(1)),
            submit_timeout: Duration::from_secs(submit_timeout.max(1)),
            stream_grace: Duration::from_millis(grace_ms),
            stream_reconnect: defaults.stream_reconnect,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, %default, "ignoring malformed setting");
            default
        }),
    }
}
