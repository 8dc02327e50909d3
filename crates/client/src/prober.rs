//! Readiness probing.
//!
//! A probing run goes `Idle -> Probing -> {Ready, Exhausted}`. Exhaustion is
//! not an error: callers proceed optimistically and let submission fail with
//! a clearer error if the backend really is down.

use std::sync::Arc;
use std::time::Duration;

use auditrelay_core::{ActivityLog, BackoffPolicy, LogEntry, LogSource, ProbeAttempt, ProbeOutcome};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::transport::{Backend, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub readiness: Readiness,
    pub attempts: Vec<ProbeAttempt>,
}

impl ProbeReport {
    pub fn is_ready(&self) -> bool {
        self.readiness == Readiness::Ready
    }
}

pub struct ReadinessProber {
    backend: Arc<dyn Backend>,
    policy: BackoffPolicy,
    attempt_timeout: Duration,
}

impl ReadinessProber {
    pub fn new(backend: Arc<dyn Backend>, policy: BackoffPolicy, attempt_timeout: Duration) -> Self {
        Self {
            backend,
            policy,
            attempt_timeout,
        }
    }

    /// Check liveness until healthy or out of attempts, logging each attempt.
    pub async fn probe(&self, log: &ActivityLog) -> ProbeReport {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = Vec::new();

        log.append(LogEntry::info(
            LogSource::Probe,
            format!("checking backend readiness (up to {max_attempts} attempts)"),
        ));

        for sequence in 1..=max_attempts {
            let started_at = Utc::now();
            let clock = Instant::now();
            let outcome = self.check_once().await;
            let attempt = ProbeAttempt {
                sequence,
                started_at,
                outcome,
                latency: clock.elapsed(),
            };

            if attempt.outcome.is_success() {
                log.append(
                    LogEntry::info(
                        LogSource::Probe,
                        format!(
                            "backend ready after {sequence} attempt(s) ({} ms)",
                            attempt.latency.as_millis()
                        ),
                    )
                    .with_probe(attempt.clone()),
                );
                attempts.push(attempt);
                return ProbeReport {
                    readiness: Readiness::Ready,
                    attempts,
                };
            }

            if sequence == max_attempts {
                log.append(
                    LogEntry::warn(
                        LogSource::Probe,
                        format!(
                            "attempt {sequence}/{max_attempts}: backend {}; giving up, proceeding anyway",
                            attempt.outcome.label()
                        ),
                    )
                    .with_probe(attempt.clone()),
                );
                attempts.push(attempt);
                break;
            }

            let wait = self.policy.delay(sequence - 1);
            log.append(
                LogEntry::warn(
                    LogSource::Probe,
                    format!(
                        "attempt {sequence}/{max_attempts}: backend {}; retrying in {:.1}s",
                        attempt.outcome.label(),
                        wait.as_secs_f64()
                    ),
                )
                .with_probe(attempt.clone())
                .with_wait(wait),
            );
            attempts.push(attempt);
            tokio::time::sleep(wait).await;
        }

        ProbeReport {
            readiness: Readiness::Exhausted,
            attempts,
        }
    }

    /// Run one probe in the background, e.g. at startup.
    pub fn spawn(self: &Arc<Self>, log: ActivityLog) -> JoinHandle<ProbeReport> {
        let prober = Arc::clone(self);
        tokio::spawn(async move { prober.probe(&log).await })
    }

    async fn check_once(&self) -> ProbeOutcome {
        let check = self.backend.check_health(self.attempt_timeout);
        match tokio::time::timeout(self.attempt_timeout, check).await {
            Err(_) | Ok(Err(TransportError::Timeout(_))) => ProbeOutcome::Timeout,
            Ok(Err(TransportError::Http { status, message, .. })) => ProbeOutcome::HttpError {
                status,
                detail: Some(message),
            },
            Ok(Err(e)) => ProbeOutcome::NetworkError {
                message: e.to_string(),
            },
            Ok(Ok(report)) if report.healthy => ProbeOutcome::Success,
            Ok(Ok(report)) => ProbeOutcome::HttpError {
                status: report.status,
                detail: report.detail,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use auditrelay_core::{Jitter, LogLevel};
    use proptest::prelude::*;

    use super::*;
    use crate::testing::{FakeBackend, HealthScript};

    fn prober(backend: Arc<FakeBackend>, attempts: u32) -> ReadinessProber {
        ReadinessProber::new(
            backend,
            BackoffPolicy::probing()
                .with_max_attempts(attempts)
                .with_jitter(Jitter::None),
            Duration::from_secs(5),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_backend_is_ready_on_first_attempt() {
        let backend = Arc::new(FakeBackend::new());
        let log = ActivityLog::new();

        let report = prober(backend.clone(), 5).probe(&log).await;

        assert!(report.is_ready());
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(backend.health_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cold_start_recovers_on_third_attempt() {
        let backend = Arc::new(FakeBackend::new().with_health([
            HealthScript::Network,
            HealthScript::Unhealthy(503),
            HealthScript::Healthy,
        ]));
        let log = ActivityLog::new();

        let report = prober(backend, 5).probe(&log).await;

        assert_eq!(report.readiness, Readiness::Ready);
        let sequences: Vec<u32> = report.attempts.iter().map(|a| a.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert!(matches!(report.attempts[0].outcome, ProbeOutcome::NetworkError { .. }));
        assert!(report.attempts[1].outcome.is_soft_failure());

        let entries = log.from_source(LogSource::Probe);
        let waits: Vec<u64> = entries.iter().filter_map(|e| e.wait_ms).collect();
        assert_eq!(waits, vec![1000, 2000]);

        let logged: Vec<&ProbeAttempt> = entries.iter().filter_map(|e| e.probe.as_ref()).collect();
        assert_eq!(logged.len(), 3);
        assert!(matches!(logged[0].outcome, ProbeOutcome::NetworkError { .. }));
        assert_eq!(
            logged[1].outcome,
            ProbeOutcome::HttpError {
                status: 503,
                detail: Some("starting".into()),
            }
        );
        assert_eq!(logged[2].outcome, ProbeOutcome::Success);
        assert!(
            entries
                .iter()
                .filter(|e| e.probe.is_some())
                .all(|e| e.attempt == e.probe.as_ref().map(|p| p.sequence))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_reported_not_raised() {
        let backend = Arc::new(FakeBackend::new().with_health([
            HealthScript::Hang,
            HealthScript::Hang,
            HealthScript::Hang,
        ]));
        let log = ActivityLog::new();

        let report = prober(backend, 3).probe(&log).await;

        assert_eq!(report.readiness, Readiness::Exhausted);
        assert_eq!(report.attempts.len(), 3);
        assert!(report.attempts.iter().all(|a| a.outcome == ProbeOutcome::Timeout));
        let last = log.snapshot().pop().unwrap();
        assert_eq!(last.level, LogLevel::Warn);
        assert!(last.message.contains("giving up"));
    }

    fn health_script(code: u8) -> HealthScript {
        match code {
            0 => HealthScript::Healthy,
            1 => HealthScript::Unhealthy(503),
            2 => HealthScript::Network,
            _ => HealthScript::Hang,
        }
    }

    proptest! {
        #[test]
        fn any_failure_sequence_stays_within_attempt_bound(
            codes in prop::collection::vec(0u8..4, 0..12),
            bound in 1u32..8,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let backend = Arc::new(FakeBackend::new().with_health(codes.iter().map(|c| health_script(*c))));
            let log = ActivityLog::new();

            let report = runtime.block_on(prober(backend.clone(), bound).probe(&log));

            // Unscripted checks answer healthy.
            let first_healthy = codes.iter().position(|c| *c == 0).unwrap_or(codes.len());
            let expected = (first_healthy as u32 + 1).min(bound);

            prop_assert_eq!(report.attempts.len() as u32, expected);
            prop_assert_eq!(backend.health_calls(), expected);
            prop_assert!(report.attempts.len() as u32 <= bound);
            let sequences: Vec<u32> = report.attempts.iter().map(|a| a.sequence).collect();
            prop_assert_eq!(sequences, (1..=expected).collect::<Vec<_>>());
            prop_assert_eq!(report.is_ready(), (first_healthy as u32) < bound);
            let logged = log.snapshot().iter().filter(|e| e.probe.is_some()).count();
            prop_assert_eq!(logged as u32, expected);
        }
    }
}
