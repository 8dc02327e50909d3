//! End-to-end submission of one audit.
//!
//! The progress channel is opened before the job is submitted so early
//! events are not missed, and stays open for a grace period after the
//! response so trailing events still arrive. If the backend answers with a
//! different correlation id, the old channel is closed before one is opened
//! for the new id.

use std::sync::Arc;

use auditrelay_core::{
    ActivityLog, AuditError, AuditJob, AuditResult, AuditTarget, CorrelationId, JobStatus,
    LogEntry, LogSource,
};
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::http::HttpBackend;
use crate::prober::{ProbeReport, ReadinessProber};
use crate::stream::{EventStreamConsumer, ProgressFeed, ProgressSender, StreamRegistry, progress_channel};
use crate::transport::{Backend, SubmitRequest, SubmitResponse, TransportError};

/// What a caller gets back for a completed audit.
#[derive(Debug, Clone)]
pub struct AuditReport {
    pub job: AuditJob,
    pub result: JsonValue,
}

/// Caller-owned channels for one job run.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub log: ActivityLog,
    pub sink: ProgressSender,
    pub status: watch::Sender<JobStatus>,
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn new(log: ActivityLog) -> (Self, ProgressFeed, watch::Receiver<JobStatus>) {
        let (sink, feed) = progress_channel();
        let (status, status_rx) = watch::channel(JobStatus::Pending);
        let ctx = Self {
            log,
            sink,
            status,
            cancel: CancellationToken::new(),
        };
        (ctx, feed, status_rx)
    }
}

/// A job running in the background.
#[derive(Debug)]
pub struct AuditHandle {
    log: ActivityLog,
    progress: Option<ProgressFeed>,
    status: watch::Receiver<JobStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<AuditResult<AuditReport>>>,
}

impl AuditHandle {
    pub fn log(&self) -> &ActivityLog {
        &self.log
    }

    /// The job's progress events. Can be taken once.
    pub fn take_progress(&mut self) -> Option<ProgressFeed> {
        self.progress.take()
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    pub fn status_updates(&self) -> watch::Receiver<JobStatus> {
        self.status.clone()
    }

    /// Abandon the job. Its progress channel closes without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the job's single terminal outcome.
    pub async fn outcome(&mut self) -> AuditResult<AuditReport> {
        let Some(task) = self.task.as_mut() else {
            return Err(AuditError::stream("outcome already taken"));
        };
        let joined = task.await;
        self.task = None;
        match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Err(AuditError::Cancelled),
            Err(e) => Err(AuditError::stream(format!("audit task failed: {e}"))),
        }
    }
}

enum SubmitFailure {
    Cancelled,
    Transport(TransportError),
}

pub struct AuditOrchestrator {
    backend: Arc<dyn Backend>,
    prober: Arc<ReadinessProber>,
    registry: StreamRegistry,
    config: ClientConfig,
}

impl AuditOrchestrator {
    pub fn new(backend: Arc<dyn Backend>, config: ClientConfig) -> Self {
        let prober = Arc::new(ReadinessProber::new(
            Arc::clone(&backend),
            config.probe.clone(),
            config.probe_timeout,
        ));
        Self {
            backend,
            prober,
            registry: StreamRegistry::new(),
            config,
        }
    }

    /// Talk to the backend at `config.backend_url` over HTTP.
    pub fn connect(config: ClientConfig) -> Result<Self, TransportError> {
        let backend = HttpBackend::new(config.backend_url.clone())?;
        Ok(Self::new(Arc::new(backend), config))
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Probe opportunistically, e.g. at application start.
    pub fn warm_up(&self, log: ActivityLog) -> JoinHandle<ProbeReport> {
        self.prober.spawn(log)
    }

    /// Run a job in the background.
    pub fn spawn(self: &Arc<Self>, raw_target: &str, log: ActivityLog) -> AuditHandle {
        let (ctx, feed, status) = JobContext::new(log.clone());
        let cancel = ctx.cancel.clone();
        let orchestrator = Arc::clone(self);
        let raw_target = raw_target.to_string();
        let task = tokio::spawn(async move { orchestrator.run(&raw_target, ctx).await });

        AuditHandle {
            log,
            progress: Some(feed),
            status,
            cancel,
            task: Some(task),
        }
    }

    /// Validate, probe, open the progress channel, submit with retries,
    /// reconcile the correlation id and settle the job.
    pub async fn run(&self, raw_target: &str, ctx: JobContext) -> AuditResult<AuditReport> {
        let target = match AuditTarget::parse(raw_target) {
            Ok(target) => target,
            Err(e) => {
                ctx.log.append(LogEntry::error(LogSource::Job, e.to_string()));
                return Err(e);
            }
        };

        let mut job = AuditJob::new(target, CorrelationId::generate());
        info!(job_id = %job.id, correlation_id = %job.correlation_id(), target = %job.target, "audit job created");
        ctx.log.append(LogEntry::info(
            LogSource::Job,
            format!("auditing {} (correlation id {})", job.target, job.correlation_id()),
        ));

        self.transition(&mut job, JobStatus::AwaitingReadiness, &ctx);
        if !self.probe(&ctx).await {
            return self.abandon(&mut job, None, &ctx).await;
        }

        let mut consumer = self.registry.open(
            Arc::clone(&self.backend),
            job.correlation_id().clone(),
            ctx.sink.clone(),
            ctx.log.clone(),
            self.config.stream_reconnect.clone(),
        )?;
        self.transition(&mut job, JobStatus::Submitted, &ctx);

        let connected = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return self.abandon(&mut job, Some(consumer), &ctx).await,
            connected = tokio::time::timeout(self.config.probe_timeout, consumer.wait_connected()) => {
                matches!(connected, Ok(true))
            }
        };
        if !connected {
            ctx.log.append(LogEntry::warn(
                LogSource::Stream,
                "progress channel not confirmed open; early events may be missed",
            ));
        }

        let response = match self.submit_with_retry(&mut job, &consumer, &ctx).await {
            Ok(response) => response,
            Err(SubmitFailure::Cancelled) => return self.abandon(&mut job, Some(consumer), &ctx).await,
            Err(SubmitFailure::Transport(e)) => {
                return self.fail(&mut job, consumer, e.into_audit_error(), &ctx);
            }
        };

        match response.correlation_id.as_ref() {
            Some(assigned) if assigned != job.correlation_id() => {
                consumer = match self.reconcile(&mut job, consumer, assigned.clone(), &ctx).await {
                    Ok(consumer) => consumer,
                    Err(e) => {
                        if let Err(te) = job.mark_failed(e.code()) {
                            warn!(job_id = %job.id, error = %te, "could not fail job");
                        }
                        ctx.status.send_replace(job.status().clone());
                        ctx.log.append(LogEntry::error(LogSource::Job, e.to_string()));
                        return Err(e);
                    }
                };
            }
            _ => ctx.log.append(LogEntry::info(
                LogSource::Stream,
                format!("correlation id confirmed: {}", job.correlation_id()),
            )),
        }

        if let Err(e) = job.mark_completed() {
            warn!(job_id = %job.id, error = %e, "could not complete job");
        }
        ctx.status.send_replace(job.status().clone());
        ctx.log.append(LogEntry::info(LogSource::Job, "audit completed"));
        self.close_after_grace(consumer, &ctx);

        Ok(AuditReport {
            job,
            result: response.result,
        })
    }

    /// `false` only when cancelled. Exhaustion still proceeds.
    async fn probe(&self, ctx: &JobContext) -> bool {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => false,
            report = self.prober.probe(&ctx.log) => {
                if !report.is_ready() {
                    ctx.log.append(LogEntry::warn(
                        LogSource::Probe,
                        "backend not confirmed ready; submitting anyway",
                    ));
                }
                true
            }
        }
    }

    async fn submit_with_retry(
        &self,
        job: &mut AuditJob,
        consumer: &EventStreamConsumer,
        ctx: &JobContext,
    ) -> Result<SubmitResponse, SubmitFailure> {
        let policy = &self.config.submission;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            ctx.log.append(
                LogEntry::info(
                    LogSource::Submission,
                    format!("submitting audit (attempt {attempt}/{max_attempts})"),
                )
                .with_attempt(attempt),
            );

            let error = match self.submit_once(job, consumer, ctx).await {
                Ok(response) => {
                    ctx.log.append(
                        LogEntry::info(LogSource::Submission, "backend accepted the audit")
                            .with_attempt(attempt),
                    );
                    return Ok(response);
                }
                Err(SubmitFailure::Cancelled) => return Err(SubmitFailure::Cancelled),
                Err(SubmitFailure::Transport(e)) => e,
            };

            if !error.is_transient() || !policy.should_retry(attempt) {
                ctx.log.append(
                    LogEntry::error(
                        LogSource::Submission,
                        format!("submission attempt {attempt}/{max_attempts} failed: {error}"),
                    )
                    .with_attempt(attempt),
                );
                return Err(SubmitFailure::Transport(error));
            }

            let wait = policy.delay(attempt - 1);
            ctx.log.append(
                LogEntry::warn(
                    LogSource::Submission,
                    format!(
                        "submission attempt {attempt}/{max_attempts} failed: {error}; re-checking backend, retrying in {:.1}s",
                        wait.as_secs_f64()
                    ),
                )
                .with_attempt(attempt)
                .with_wait(wait),
            );

            if !self.probe(ctx).await {
                return Err(SubmitFailure::Cancelled);
            }
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(SubmitFailure::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
            attempt += 1;
        }
    }

    /// One request. Moves the job to `Streaming` on the first pipeline event.
    async fn submit_once(
        &self,
        job: &mut AuditJob,
        consumer: &EventStreamConsumer,
        ctx: &JobContext,
    ) -> Result<SubmitResponse, SubmitFailure> {
        let request = SubmitRequest {
            target: job.target.to_string(),
            correlation_id: job.correlation_id().clone(),
        };
        let timeout = self.config.submit_timeout;
        let submit = tokio::time::timeout(timeout, self.backend.submit(&request, timeout));
        tokio::pin!(submit);

        let mut events = consumer.pipeline_events();
        let mut watching = *job.status() == JobStatus::Submitted;

        loop {
            if watching && *events.borrow_and_update() > 0 {
                watching = false;
                self.transition(job, JobStatus::Streaming, ctx);
            }

            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(SubmitFailure::Cancelled),
                outcome = &mut submit => {
                    return match outcome {
                        Ok(result) => result.map_err(SubmitFailure::Transport),
                        Err(_) => Err(SubmitFailure::Transport(TransportError::Timeout(timeout))),
                    };
                }
                changed = events.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    }
                }
            }
        }
    }

    /// Close the channel for the old id, then open one for `assigned`.
    async fn reconcile(
        &self,
        job: &mut AuditJob,
        consumer: EventStreamConsumer,
        assigned: CorrelationId,
        ctx: &JobContext,
    ) -> AuditResult<EventStreamConsumer> {
        let previous = job.correlation_id().clone();
        ctx.log.append(LogEntry::warn(
            LogSource::Stream,
            format!("correlation id reassigned: {assigned} (was {previous}); switching progress channel"),
        ));

        consumer.close().await;
        job.reconcile(assigned)?;
        ctx.status.send_replace(job.status().clone());

        self.registry.open(
            Arc::clone(&self.backend),
            job.correlation_id().clone(),
            ctx.sink.clone(),
            ctx.log.clone(),
            self.config.stream_reconnect.clone(),
        )
    }

    fn fail(
        &self,
        job: &mut AuditJob,
        consumer: EventStreamConsumer,
        error: AuditError,
        ctx: &JobContext,
    ) -> AuditResult<AuditReport> {
        if let Err(e) = job.mark_failed(error.code()) {
            warn!(job_id = %job.id, error = %e, "could not fail job");
        }
        ctx.status.send_replace(job.status().clone());
        ctx.log.append(LogEntry::error(LogSource::Job, format!("audit failed: {error}")));
        self.close_after_grace(consumer, ctx);
        Err(error)
    }

    /// Cancellation: close immediately, no trailing events.
    async fn abandon(
        &self,
        job: &mut AuditJob,
        consumer: Option<EventStreamConsumer>,
        ctx: &JobContext,
    ) -> AuditResult<AuditReport> {
        if let Some(consumer) = consumer {
            consumer.close().await;
        }
        if let Err(e) = job.mark_failed(AuditError::Cancelled.code()) {
            warn!(job_id = %job.id, error = %e, "could not cancel job");
        }
        ctx.status.send_replace(job.status().clone());
        ctx.log.append(LogEntry::warn(LogSource::Job, "audit cancelled"));
        Err(AuditError::Cancelled)
    }

    /// Keep delivering until a terminal event, the grace period or cancellation.
    fn close_after_grace(&self, mut consumer: EventStreamConsumer, ctx: &JobContext) {
        let grace = self.config.stream_grace;
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = consumer.terminal_seen() => {}
                _ = tokio::time::sleep(grace) => {}
                _ = cancel.cancelled() => {}
            }
            consumer.close().await;
        });
    }

    fn transition(&self, job: &mut AuditJob, next: JobStatus, ctx: &JobContext) {
        match job.advance(next) {
            Ok(()) => {
                info!(job_id = %job.id, status = ?job.status(), "job status changed");
                ctx.status.send_replace(job.status().clone());
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "ignored status change"),
        }
    }
}
