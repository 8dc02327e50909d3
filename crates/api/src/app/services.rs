//! Server-side wiring: the progress hub, in-flight jobs and the pipeline.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use auditrelay_core::{CorrelationId, EventBody, ProgressEvent};
use auditrelay_pipeline::{Analyzer, OfflineAnalyzer, PipelineRunner, ProgressSink};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::config::ServerConfig;

const CHANNEL_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-correlation-id progress fan-out. Lossy: slow subscribers lag, the
/// pipeline never waits.
#[derive(Debug, Default)]
pub struct EventHub {
    channels: Mutex<HashMap<CorrelationId, broadcast::Sender<ProgressEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, id: &CorrelationId) -> broadcast::Sender<ProgressEvent> {
        lock(&self.channels)
            .entry(id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, id: &CorrelationId) -> broadcast::Receiver<ProgressEvent> {
        self.sender(id).subscribe()
    }

    /// Number of subscribers that received the event.
    pub fn publish(&self, id: &CorrelationId, event: ProgressEvent) -> usize {
        self.sender(id).send(event).unwrap_or(0)
    }

    /// Drop the channel for `id` once nobody listens.
    pub fn prune(&self, id: &CorrelationId) {
        let mut channels = lock(&self.channels);
        if channels.get(id).is_some_and(|tx| tx.receiver_count() == 0) {
            channels.remove(id);
        }
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }
}

/// Publishes one job's pipeline events to the hub.
pub struct HubSink {
    hub: Arc<EventHub>,
    correlation_id: CorrelationId,
}

impl HubSink {
    pub fn new(hub: Arc<EventHub>, correlation_id: CorrelationId) -> Self {
        Self { hub, correlation_id }
    }
}

impl ProgressSink for HubSink {
    fn emit(&self, event: ProgressEvent) {
        let delivered = self.hub.publish(&self.correlation_id, event);
        debug!(correlation_id = %self.correlation_id, delivered, "progress event published");
    }
}

/// Correlation ids bound to a running job.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    in_flight: Arc<Mutex<HashSet<CorrelationId>>>,
}

/// Holds a correlation id for the lifetime of one request.
#[derive(Debug)]
pub struct InFlight {
    registry: JobRegistry,
    correlation_id: CorrelationId,
}

impl InFlight {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.registry.in_flight).remove(&self.correlation_id);
    }
}

impl JobRegistry {
    /// Bind the requested id, or a fresh one when it is missing, unusable or
    /// already taken by another job.
    pub fn claim(&self, requested: Option<&str>) -> InFlight {
        let mut in_flight = lock(&self.in_flight);

        let requested = requested.and_then(|raw| raw.parse::<CorrelationId>().ok());
        let correlation_id = match requested {
            Some(id) if !in_flight.contains(&id) => id,
            _ => loop {
                let candidate = CorrelationId::generate();
                if !in_flight.contains(&candidate) {
                    break candidate;
                }
            },
        };
        in_flight.insert(correlation_id.clone());

        InFlight {
            registry: self.clone(),
            correlation_id,
        }
    }

    pub fn is_in_flight(&self, id: &CorrelationId) -> bool {
        lock(&self.in_flight).contains(id)
    }
}

pub struct AppServices {
    pub hub: Arc<EventHub>,
    pub jobs: JobRegistry,
    pub runner: PipelineRunner,
    started_at: Instant,
    warmup: Duration,
}

impl AppServices {
    pub fn is_warming_up(&self) -> bool {
        self.started_at.elapsed() < self.warmup
    }
}

pub fn build_services(config: &ServerConfig) -> AppServices {
    build_services_with(config, Arc::new(OfflineAnalyzer))
}

pub fn build_services_with(config: &ServerConfig, analyzer: Arc<dyn Analyzer>) -> AppServices {
    AppServices {
        hub: Arc::new(EventHub::new()),
        jobs: JobRegistry::default(),
        runner: PipelineRunner::new(analyzer).with_policy(config.stage_policy.clone()),
        started_at: Instant::now(),
        warmup: config.warmup,
    }
}

/// Prunes the hub channel when the SSE response is dropped.
struct Subscription {
    hub: Arc<EventHub>,
    correlation_id: CorrelationId,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.prune(&self.correlation_id);
    }
}

fn to_sse(event: &ProgressEvent) -> SseEvent {
    SseEvent::default().event(event.kind()).data(event.to_frame())
}

/// `connected`, then every event published for `correlation_id`.
pub fn progress_sse_stream(
    hub: Arc<EventHub>,
    correlation_id: CorrelationId,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = hub.subscribe(&correlation_id);
    let connected = ProgressEvent::now(EventBody::Connected {
        correlation_id: correlation_id.clone(),
    });

    let subscription = Subscription {
        hub,
        correlation_id: correlation_id.clone(),
    };
    let events = BroadcastStream::new(rx).filter_map(move |msg| {
        let _held = &subscription;
        match msg {
            Ok(event) => Some(Ok(to_sse(&event))),
            Err(lagged) => {
                warn!(correlation_id = %subscription.correlation_id, error = %lagged, "progress subscriber lagged");
                None
            }
        }
    });

    let stream = tokio_stream::once(Ok(to_sse(&connected))).chain(events);
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
