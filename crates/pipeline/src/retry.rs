//! Stage retry planning.

use std::time::Duration;

use auditrelay_core::{BackoffPolicy, Jitter, RetryEventPayload, WaitSource};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::upstream::UpstreamError;

/// How a stage waits out recoverable upstream failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRetryPolicy {
    /// Attempts per stage, including the first.
    pub max_attempts: u32,
    /// Fallback wait for rate limiting (exponential by attempt).
    pub rate_limit_backoff: BackoffPolicy,
    /// Fallback wait for quota exhaustion.
    pub quota_fallback: Duration,
    /// Added to every wait.
    pub jitter: Jitter,
}

impl Default for StageRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rate_limit_backoff: BackoffPolicy::exponential(
                3,
                Duration::from_secs(2),
                Duration::from_secs(60),
            ),
            quota_fallback: Duration::from_secs(60),
            jitter: Jitter::uniform(Duration::from_secs(2)),
        }
    }
}

/// Decided wait before the next attempt of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPlan {
    pub source: WaitSource,
    pub wait: Duration,
    pub jitter: Duration,
}

impl RetryPlan {
    pub fn total(&self) -> Duration {
        self.wait.saturating_add(self.jitter)
    }

    /// Event payload for the attempt (one-based) that just failed.
    pub fn payload(&self, agent_name: &str, attempt: u32, max_attempts: u32) -> RetryEventPayload {
        RetryEventPayload::new(
            agent_name,
            attempt,
            max_attempts,
            self.wait,
            self.source,
            self.jitter,
        )
    }
}

impl StageRetryPolicy {
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Plan a retry after attempt `attempt` (one-based) failed with `error`.
    ///
    /// `None` when the error is fatal or the attempt bound is reached.
    pub fn plan(&self, attempt: u32, error: &UpstreamError) -> Option<RetryPlan> {
        self.plan_with(attempt, error, &mut rand::thread_rng())
    }

    pub fn plan_with<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        error: &UpstreamError,
        rng: &mut R,
    ) -> Option<RetryPlan> {
        if !error.is_recoverable() || attempt >= self.max_attempts {
            return None;
        }

        let (source, wait) = match (error.retry_after(), error) {
            (Some(hint), _) => (WaitSource::Upstream, hint),
            (None, UpstreamError::QuotaExhausted { .. }) => (WaitSource::Fallback, self.quota_fallback),
            (None, _) => (
                WaitSource::Fallback,
                self.rate_limit_backoff.base_delay(attempt.saturating_sub(1)),
            ),
        };

        Some(RetryPlan {
            source,
            wait,
            jitter: self.jitter.sample(rng),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_jitter(ms: u64) -> StageRetryPolicy {
        StageRetryPolicy::default().with_jitter(Jitter::Fixed(Duration::from_millis(ms)))
    }

    #[test]
    fn upstream_hint_wins_over_fallback() {
        let err = UpstreamError::QuotaExhausted {
            retry_after: Some(Duration::from_secs(20)),
            message: "quota".into(),
        };
        let plan = fixed_jitter(1400).plan(1, &err).unwrap();
        assert_eq!(plan.source, WaitSource::Upstream);
        assert_eq!(plan.total(), Duration::from_millis(21_400));

        let payload = plan.payload("comparative-analysis", 1, 3);
        assert_eq!(payload.total_wait_seconds, 21.4);
    }

    #[test]
    fn rate_limit_fallback_grows_exponentially() {
        let policy = fixed_jitter(0);
        let err = UpstreamError::classify("429");
        assert_eq!(policy.plan(1, &err).unwrap().wait, Duration::from_secs(2));
        assert_eq!(policy.plan(2, &err).unwrap().wait, Duration::from_secs(4));
        assert_eq!(policy.plan(1, &err).unwrap().source, WaitSource::Fallback);
    }

    #[test]
    fn quota_fallback_is_fixed() {
        let policy = fixed_jitter(0);
        let err = UpstreamError::classify("quota exceeded");
        assert_eq!(policy.plan(1, &err).unwrap().wait, Duration::from_secs(60));
        assert_eq!(policy.plan(2, &err).unwrap().wait, Duration::from_secs(60));
    }

    #[test]
    fn no_plan_for_fatal_or_exhausted() {
        let policy = StageRetryPolicy::default();
        assert!(policy.plan(1, &UpstreamError::fatal("bad")).is_none());
        assert!(policy.plan(3, &UpstreamError::classify("429")).is_none());
    }
}
