//! Sequential stage runner with per-stage retry.

use std::sync::Arc;

use auditrelay_core::{AuditTarget, EventBody, ProgressEvent};
use serde_json::{Map, Value as JsonValue, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analyzer::{Analyzer, StageInput};
use crate::retry::StageRetryPolicy;
use crate::sink::ProgressSink;
use crate::upstream::UpstreamError;

/// Page inspection, then comparative analysis, then recommendations.
pub const DEFAULT_STAGES: [&str; 3] = [
    "page-inspection",
    "comparative-analysis",
    "recommendation-generation",
];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    /// A stage gave up, either on a fatal error or after its attempt bound.
    #[error("stage {agent} failed after {attempts} attempt(s): {source}")]
    StageFailed {
        agent: String,
        attempts: u32,
        #[source]
        source: UpstreamError,
    },
}

impl PipelineError {
    pub fn agent(&self) -> &str {
        match self {
            PipelineError::StageFailed { agent, .. } => agent,
        }
    }
}

/// Runs one audit's stages in order, emitting progress as it goes.
pub struct PipelineRunner {
    analyzer: Arc<dyn Analyzer>,
    stages: Vec<String>,
    policy: StageRetryPolicy,
}

impl PipelineRunner {
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        Self {
            analyzer,
            stages: DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(),
            policy: StageRetryPolicy::default(),
        }
    }

    pub fn with_stages<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stages = stages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_policy(mut self, policy: StageRetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    /// Run every stage; the aggregate result is `{ target, stages: { <name>: <output> } }`.
    pub async fn run(
        &self,
        target: &AuditTarget,
        sink: &dyn ProgressSink,
    ) -> Result<JsonValue, PipelineError> {
        info!(target = %target, stages = self.stages.len(), "audit pipeline started");
        sink.emit(ProgressEvent::now(EventBody::AuditStarted {
            target: target.to_string(),
            stages: self.stages.clone(),
        }));

        let mut outputs = Map::new();
        for stage in &self.stages {
            let input = StageInput {
                target: target.clone(),
                prior: outputs.clone(),
            };
            let output = self.run_stage(stage, &input, sink).await?;
            outputs.insert(stage.clone(), output);
        }

        let result = json!({
            "target": target.as_str(),
            "stages": JsonValue::Object(outputs),
        });
        sink.emit(ProgressEvent::now(EventBody::AuditCompleted {
            result: result.clone(),
        }));
        info!(target = %target, "audit pipeline completed");
        Ok(result)
    }

    async fn run_stage(
        &self,
        stage: &str,
        input: &StageInput,
        sink: &dyn ProgressSink,
    ) -> Result<JsonValue, PipelineError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!(agent = stage, attempt, max_attempts, "running stage");

            let error = match self.analyzer.run_stage(stage, input).await {
                Ok(output) => {
                    if attempt > 1 {
                        info!(agent = stage, attempts = attempt, "stage recovered after retry");
                        sink.emit(ProgressEvent::now(EventBody::RetryComplete {
                            agent_name: stage.to_string(),
                            attempts: attempt,
                        }));
                    }
                    return Ok(output);
                }
                Err(error) => error,
            };

            let Some(plan) = self.policy.plan(attempt, &error) else {
                warn!(agent = stage, attempt, error = %error, "stage failed");
                sink.emit(ProgressEvent::now(EventBody::AuditError {
                    agent_name: Some(stage.to_string()),
                    message: if error.is_recoverable() {
                        format!("exhausted {attempt} attempt(s): {}", error.message())
                    } else {
                        error.message().to_string()
                    },
                }));
                return Err(PipelineError::StageFailed {
                    agent: stage.to_string(),
                    attempts: attempt,
                    source: error,
                });
            };

            let payload = plan
                .payload(stage, attempt, max_attempts)
                .with_message(error.message());
            warn!(
                agent = stage,
                attempt,
                max_attempts,
                wait_ms = plan.total().as_millis() as u64,
                source = ?plan.source,
                "recoverable upstream failure; retrying stage"
            );
            let body = match error {
                UpstreamError::QuotaExhausted { .. } => EventBody::QuotaExhaustedRetry(payload),
                _ => EventBody::RateLimitRetry(payload),
            };
            sink.emit(ProgressEvent::now(body));

            tokio::time::sleep(plan.total()).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use auditrelay_core::{Jitter, WaitSource};

    use super::*;
    use crate::sink::CollectingSink;

    /// Returns queued outcomes per stage; succeeds once a stage's queue is empty.
    #[derive(Default)]
    struct ScriptedAnalyzer {
        script: Mutex<HashMap<String, VecDeque<UpstreamError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedAnalyzer {
        fn fail(self, stage: &str, error: UpstreamError) -> Self {
            self.script
                .lock()
                .unwrap()
                .entry(stage.to_string())
                .or_default()
                .push_back(error);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Analyzer for ScriptedAnalyzer {
        async fn run_stage(&self, stage: &str, _input: &StageInput) -> Result<JsonValue, UpstreamError> {
            self.calls.lock().unwrap().push(stage.to_string());
            match self.script.lock().unwrap().get_mut(stage).and_then(VecDeque::pop_front) {
                Some(err) => Err(err),
                None => Ok(json!({ "stage": stage })),
            }
        }
    }

    fn target() -> AuditTarget {
        AuditTarget::parse("https://example.com").unwrap()
    }

    fn runner(analyzer: Arc<ScriptedAnalyzer>, jitter_ms: u64) -> PipelineRunner {
        PipelineRunner::new(analyzer).with_policy(
            StageRetryPolicy::default().with_jitter(Jitter::Fixed(Duration::from_millis(jitter_ms))),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn clean_run_emits_started_then_completed() {
        let analyzer = Arc::new(ScriptedAnalyzer::default());
        let sink = CollectingSink::new();

        let result = runner(analyzer.clone(), 0).run(&target(), &sink).await.unwrap();

        assert_eq!(sink.kinds(), vec!["audit_started", "audit_completed"]);
        assert_eq!(result["target"], "https://example.com");
        assert_eq!(result["stages"]["comparative-analysis"]["stage"], "comparative-analysis");
        assert_eq!(analyzer.calls(), DEFAULT_STAGES.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn quota_retry_on_comparative_analysis() {
        let analyzer = Arc::new(ScriptedAnalyzer::default().fail(
            "comparative-analysis",
            UpstreamError::QuotaExhausted {
                retry_after: Some(Duration::from_secs(20)),
                message: "quota exceeded, retry in 20s".into(),
            },
        ));
        let sink = CollectingSink::new();

        let started = tokio::time::Instant::now();
        runner(analyzer.clone(), 1400).run(&target(), &sink).await.unwrap();

        assert_eq!(
            sink.kinds(),
            vec![
                "audit_started",
                "quota_exhausted_retry",
                "retry_complete",
                "audit_completed"
            ]
        );

        let events = sink.events();
        let payload = events[1].retry_payload().unwrap();
        assert_eq!(payload.agent_name, "comparative-analysis");
        assert_eq!(payload.attempt, 1);
        assert_eq!(payload.max_attempts, 3);
        assert_eq!(payload.wait_source, WaitSource::Upstream);
        assert_eq!(payload.total_wait_seconds, 21.4);

        assert_eq!(
            events[2].body,
            EventBody::RetryComplete {
                agent_name: "comparative-analysis".into(),
                attempts: 2,
            }
        );
        assert!(started.elapsed() >= Duration::from_millis(21_400));
        assert_eq!(
            analyzer.calls().iter().filter(|s| *s == "comparative-analysis").count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_attempt_bound_fails_job() {
        let analyzer = Arc::new(
            ScriptedAnalyzer::default()
                .fail("page-inspection", UpstreamError::classify("429"))
                .fail("page-inspection", UpstreamError::classify("429"))
                .fail("page-inspection", UpstreamError::classify("429")),
        );
        let sink = CollectingSink::new();

        let err = runner(analyzer.clone(), 0).run(&target(), &sink).await.unwrap_err();

        assert_eq!(err.agent(), "page-inspection");
        assert!(matches!(err, PipelineError::StageFailed { attempts: 3, .. }));
        assert_eq!(
            sink.kinds(),
            vec![
                "audit_started",
                "rate_limit_retry",
                "rate_limit_retry",
                "audit_error"
            ]
        );
        let events = sink.events();
        let waits: Vec<f64> = events[1..3]
            .iter()
            .map(|e| e.retry_payload().unwrap().total_wait_seconds)
            .collect();
        assert_eq!(waits, vec![2.0, 4.0]);
        assert_eq!(analyzer.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let analyzer = Arc::new(
            ScriptedAnalyzer::default()
                .fail("recommendation-generation", UpstreamError::fatal("schema mismatch")),
        );
        let sink = CollectingSink::new();

        let err = runner(analyzer, 0).run(&target(), &sink).await.unwrap_err();

        assert!(matches!(err, PipelineError::StageFailed { attempts: 1, .. }));
        let events = sink.events();
        assert_eq!(
            events.last().unwrap().body,
            EventBody::AuditError {
                agent_name: Some("recommendation-generation".into()),
                message: "schema mismatch".into(),
            }
        );
    }
}
