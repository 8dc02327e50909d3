//! Server settings from the environment.

use std::str::FromStr;
use std::time::Duration;

use auditrelay_core::{BackoffPolicy, Jitter};
use auditrelay_pipeline::StageRetryPolicy;

pub const DEFAULT_BIND: &str = "0.0.0.0:8000";

const DEFAULT_CORS_ORIGINS: [&str; 4] = [
    "http://localhost:3000",
    "http://localhost:3001",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:3001",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind: String,
    /// `/health` reports `starting` until this long after boot.
    pub warmup: Duration,
    pub stage_policy: StageRetryPolicy,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            warmup: Duration::ZERO,
            stage_policy: StageRetryPolicy::default(),
            cors_origins: DEFAULT_CORS_ORIGINS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let bind = lookup("AUDITRELAY_BIND")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.bind);
        let warmup_secs = parse_or(&lookup, "AUDITRELAY_WARMUP_SECS", 0u64);

        let max_attempts = parse_or(
            &lookup,
            "AUDITRELAY_STAGE_MAX_ATTEMPTS",
            defaults.stage_policy.max_attempts,
        )
        .max(1);
        let rate_limit_base = parse_or(&lookup, "AUDITRELAY_RATE_LIMIT_BASE_SECS", 2u64);
        let quota_fallback = parse_or(&lookup, "AUDITRELAY_QUOTA_FALLBACK_SECS", 60u64);
        let jitter_ms = parse_or(&lookup, "AUDITRELAY_STAGE_JITTER_MS", 2000u64);

        let stage_policy = StageRetryPolicy {
            max_attempts,
            rate_limit_backoff: BackoffPolicy::exponential(
                max_attempts,
                Duration::from_secs(rate_limit_base),
                Duration::from_secs(60),
            ),
            quota_fallback: Duration::from_secs(quota_fallback),
            jitter: if jitter_ms == 0 {
                Jitter::None
            } else {
                Jitter::uniform(Duration::from_millis(jitter_ms))
            },
        };

        let cors_origins = lookup("AUDITRELAY_CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|origins| !origins.is_empty())
            .unwrap_or(defaults.cors_origins);

        Self {
            bind,
            warmup: Duration::from_secs(warmup_secs),
            stage_policy,
            cors_origins,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_defaults() {
        let config = ServerConfig::from_lookup(|_| None);
        assert_eq!(config.bind, DEFAULT_BIND);
        assert_eq!(config.warmup, Duration::ZERO);
        assert_eq!(config.stage_policy, StageRetryPolicy::default());
        assert_eq!(config.cors_origins.len(), 4);
    }

    #[test]
    fn overrides() {
        let config = ServerConfig::from_lookup(|key| match key {
            "AUDITRELAY_WARMUP_SECS" => Some("3".into()),
            "AUDITRELAY_STAGE_JITTER_MS" => Some("0".into()),
            "AUDITRELAY_STAGE_MAX_ATTEMPTS" => Some("many".into()),
            "AUDITRELAY_CORS_ORIGINS" => Some("https://app.example.com, ".into()),
            _ => None,
        });
        assert_eq!(config.warmup, Duration::from_secs(3));
        assert_eq!(config.stage_policy.jitter, Jitter::None);
        assert_eq!(config.stage_policy.max_attempts, 3);
        assert_eq!(config.cors_origins, vec!["https://app.example.com".to_string()]);
    }
}
