//! Progress channel consumption.
//!
//! One [`EventStreamConsumer`] per correlation id. It decodes frames, forwards
//! every well-formed event to the job's [`ProgressFeed`] and reconnects after
//! drops until the orchestrator closes it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use auditrelay_core::{
    ActivityLog, AuditError, BackoffPolicy, CorrelationId, EventBody, LogEntry, LogSource,
    ProgressEvent,
};
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::Backend;

pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;

/// Events of one job, in arrival order. Ends once every consumer bound to the
/// job is closed.
#[derive(Debug)]
pub struct ProgressFeed {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

pub fn progress_channel() -> (ProgressSender, ProgressFeed) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ProgressFeed { rx })
}

impl ProgressFeed {
    /// Next event; `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<ProgressEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}

/// Tracks which correlation ids have an open consumer.
#[derive(Debug, Clone, Default)]
pub struct StreamRegistry {
    open: Arc<Mutex<HashSet<CorrelationId>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, correlation_id: &CorrelationId) -> bool {
        self.lock().contains(correlation_id)
    }

    pub fn open_count(&self) -> usize {
        self.lock().len()
    }

    /// Open a consumer, refusing a second one for the same id.
    pub fn open(
        &self,
        backend: Arc<dyn Backend>,
        correlation_id: CorrelationId,
        sink: ProgressSender,
        log: ActivityLog,
        reconnect: BackoffPolicy,
    ) -> Result<EventStreamConsumer, AuditError> {
        if !self.lock().insert(correlation_id.clone()) {
            return Err(AuditError::stream(format!(
                "progress channel for {correlation_id} is already open"
            )));
        }

        let lease = Lease {
            registry: self.clone(),
            correlation_id: correlation_id.clone(),
        };
        Ok(EventStreamConsumer::spawn(
            backend,
            correlation_id,
            sink,
            log,
            reconnect,
            lease,
        ))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<CorrelationId>> {
        self.open
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the registry slot when the consumer is gone.
#[derive(Debug)]
struct Lease {
    registry: StreamRegistry,
    correlation_id: CorrelationId,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.correlation_id);
    }
}

#[derive(Debug)]
pub struct EventStreamConsumer {
    correlation_id: CorrelationId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    connected: watch::Receiver<bool>,
    pipeline_events: watch::Receiver<u64>,
    terminal: watch::Receiver<bool>,
    _lease: Lease,
}

impl EventStreamConsumer {
    fn spawn(
        backend: Arc<dyn Backend>,
        correlation_id: CorrelationId,
        sink: ProgressSender,
        log: ActivityLog,
        reconnect: BackoffPolicy,
        lease: Lease,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (connected_tx, connected) = watch::channel(false);
        let (events_tx, pipeline_events) = watch::channel(0u64);
        let (terminal_tx, terminal) = watch::channel(false);

        let session = Session {
            backend,
            correlation_id: correlation_id.clone(),
            sink,
            log,
            reconnect,
            cancel: cancel.clone(),
            connected_tx,
            events_tx,
            terminal_tx,
        };
        let task = tokio::spawn(session.run());

        Self {
            correlation_id,
            cancel,
            task,
            connected,
            pipeline_events,
            terminal,
            _lease: lease,
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Resolves `true` once the channel has been opened, `false` if the
    /// session ended first.
    pub async fn wait_connected(&self) -> bool {
        let mut connected = self.connected.clone();
        connected.wait_for(|open| *open).await.is_ok()
    }

    /// Count of pipeline events delivered so far (`connected` excluded).
    pub fn pipeline_events(&self) -> watch::Receiver<u64> {
        self.pipeline_events.clone()
    }

    /// Resolves once a terminal event has been delivered.
    pub async fn terminal_seen(&mut self) {
        let seen = self.terminal.wait_for(|seen| *seen).await.is_ok();
        if !seen {
            // Session ended without one.
            std::future::pending::<()>().await;
        }
    }

    /// Stop delivering and release the id. Nothing is delivered after this returns.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.task).await {
            warn!(correlation_id = %self.correlation_id, error = %e, "progress consumer task failed");
        }
        debug!(correlation_id = %self.correlation_id, "progress channel closed");
    }
}

impl Drop for EventStreamConsumer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Session {
    backend: Arc<dyn Backend>,
    correlation_id: CorrelationId,
    sink: ProgressSender,
    log: ActivityLog,
    reconnect: BackoffPolicy,
    cancel: CancellationToken,
    connected_tx: watch::Sender<bool>,
    events_tx: watch::Sender<u64>,
    terminal_tx: watch::Sender<bool>,
}

impl Session {
    async fn run(self) {
        let mut drops = 0u32;

        'session: loop {
            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break 'session,
                opened = self.backend.open_stream(&self.correlation_id) => opened,
            };

            match opened {
                Ok(mut frames) => {
                    self.connected_tx.send_replace(true);
                    if drops > 0 {
                        self.log.append(LogEntry::info(
                            LogSource::Stream,
                            format!("progress channel for {} re-established", self.correlation_id),
                        ));
                    }
                    drops = 0;

                    loop {
                        let item = tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => break 'session,
                            item = frames.next() => item,
                        };
                        match item {
                            Some(Ok(frame)) => self.handle_frame(&frame.data),
                            Some(Err(e)) => self.log.append(LogEntry::warn(
                                LogSource::Stream,
                                format!("progress channel error: {e}"),
                            )),
                            None => break,
                        }
                    }
                    self.log.append(LogEntry::warn(
                        LogSource::Stream,
                        format!("progress channel for {} dropped", self.correlation_id),
                    ));
                }
                Err(e) => self.log.append(LogEntry::warn(
                    LogSource::Stream,
                    format!(
                        "could not open progress channel for {}: {e}",
                        self.correlation_id
                    ),
                )),
            }

            let wait = self.reconnect.delay(drops);
            drops = drops.saturating_add(1);
            self.log.append(
                LogEntry::info(
                    LogSource::Stream,
                    format!("reconnecting in {:.1}s", wait.as_secs_f64()),
                )
                .with_attempt(drops)
                .with_wait(wait),
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break 'session,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn handle_frame(&self, data: &str) {
        let event = match ProgressEvent::decode(data) {
            Ok(event) => event,
            Err(e) => {
                self.log.append(LogEntry::warn(
                    LogSource::Stream,
                    format!("discarding progress frame: {e}"),
                ));
                return;
            }
        };

        let entry = LogEntry::info(LogSource::Progress, event.describe());
        let entry = match event.retry_payload() {
            Some(p) => entry.with_attempt(p.attempt).with_wait(p.total_wait()),
            None => entry,
        };
        self.log.append(entry);

        let terminal = event.is_terminal();
        let pipeline = !matches!(event.body, EventBody::Connected { .. });

        // A dropped feed only means nobody is rendering.
        let _ = self.sink.send(event);

        if pipeline {
            self.events_tx.send_modify(|n| *n += 1);
        }
        if terminal {
            self.terminal_tx.send_replace(true);
        }
    }
}
