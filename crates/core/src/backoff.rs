//! Retry delay computation shared by every retry loop in the relay.
//!
//! `delay(n) = min(initial × multiplier^n, max) + jitter`, with `n` the
//! zero-based attempt index. Jitter is *added*, never multiplied, so two
//! callers that start together drift apart instead of retrying in lockstep.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Random component added on top of the exponential delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// No jitter.
    None,
    /// Uniform in `[0, max]`.
    Uniform { max: Duration },
    /// Always exactly this amount (deterministic tests and replays).
    Fixed(Duration),
}

impl Jitter {
    pub fn uniform(max: Duration) -> Self {
        Self::Uniform { max }
    }

    /// Upper bound of any sample.
    pub fn max(&self) -> Duration {
        match self {
            Jitter::None => Duration::ZERO,
            Jitter::Uniform { max } => *max,
            Jitter::Fixed(d) => *d,
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match self {
            Jitter::None => Duration::ZERO,
            Jitter::Uniform { max } if max.is_zero() => Duration::ZERO,
            Jitter::Uniform { max } => {
                let millis = rng.gen_range(0..=max.as_millis() as u64);
                Duration::from_millis(millis)
            }
            Jitter::Fixed(d) => *d,
        }
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::None
    }
}

/// Exponential backoff with a cap, an attempt bound and additive jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry (attempt index 0).
    pub initial_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    /// Growth factor between consecutive attempts.
    pub multiplier: u32,
    pub jitter: Jitter,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            multiplier: 2,
            jitter: Jitter::None,
        }
    }
}

impl BackoffPolicy {
    /// Exponential backoff (multiplier 2) without jitter.
    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts,
            multiplier: 2,
            jitter: Jitter::None,
        }
    }

    /// Readiness probing: short waits, five attempts.
    pub fn probing() -> Self {
        Self::exponential(5, Duration::from_secs(1), Duration::from_secs(8))
            .with_jitter(Jitter::uniform(Duration::from_millis(250)))
    }

    /// Job submission: three attempts, waits of a few seconds.
    pub fn submission() -> Self {
        Self::exponential(3, Duration::from_secs(2), Duration::from_secs(10))
            .with_jitter(Jitter::uniform(Duration::from_millis(500)))
    }

    /// Progress channel reconnects; unbounded, the orchestrator closes the channel.
    pub fn stream_reconnect() -> Self {
        Self::exponential(u32::MAX, Duration::from_millis(500), Duration::from_secs(5))
            .with_jitter(Jitter::uniform(Duration::from_millis(100)))
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Non-jittered component for a zero-based attempt index.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).checked_pow(attempt);
        let grown = match factor {
            Some(f) => self.initial_delay.saturating_mul(f),
            None => Duration::MAX,
        };
        grown.min(self.max_delay)
    }

    /// Delay before retry `attempt` (zero-based), jitter drawn from the thread RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        self.base_delay(attempt)
            .saturating_add(self.jitter.sample(rng))
    }

    /// Upper bound of any delay this policy can produce.
    pub fn ceiling(&self) -> Duration {
        self.max_delay.saturating_add(self.jitter.max())
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = BackoffPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped_before_jitter() {
        let policy = BackoffPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(5))
            .with_jitter(Jitter::Fixed(Duration::from_millis(300)));

        assert_eq!(policy.delay(2), Duration::from_millis(4300));
        assert_eq!(policy.delay(3), Duration::from_millis(5300));
        assert_eq!(policy.delay(40), Duration::from_millis(5300));
    }

    #[test]
    fn huge_attempt_index_does_not_overflow() {
        let policy = BackoffPolicy::stream_reconnect();
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn uniform_jitter_stays_in_range() {
        let jitter = Jitter::uniform(Duration::from_millis(250));
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            assert!(jitter.sample(&mut rng) <= Duration::from_millis(250));
        }
    }

    proptest! {
        #[test]
        fn delay_within_bounds(
            attempt in 0u32..200,
            initial_ms in 0u64..10_000,
            max_ms in 0u64..120_000,
            jitter_ms in 0u64..5_000,
            seed in any::<u64>(),
        ) {
            let policy = BackoffPolicy::exponential(10, Duration::from_millis(initial_ms), Duration::from_millis(max_ms))
                .with_jitter(Jitter::uniform(Duration::from_millis(jitter_ms)));
            let mut rng = StdRng::seed_from_u64(seed);
            let d = policy.delay_with(attempt, &mut rng);
            prop_assert!(d <= policy.ceiling());
        }

        #[test]
        fn base_delay_is_non_decreasing(
            attempt in 0u32..200,
            initial_ms in 0u64..10_000,
            max_ms in 0u64..120_000,
        ) {
            let policy = BackoffPolicy::exponential(10, Duration::from_millis(initial_ms), Duration::from_millis(max_ms));
            prop_assert!(policy.base_delay(attempt) <= policy.base_delay(attempt + 1));
        }
    }
}
