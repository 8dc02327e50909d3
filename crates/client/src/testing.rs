//! Scripted in-process backend for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use auditrelay_core::CorrelationId;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{Value as JsonValue, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::sse::SseFrame;
use crate::transport::{Backend, FrameStream, HealthReport, SubmitRequest, SubmitResponse, TransportError};

pub(crate) enum HealthScript {
    Healthy,
    Unhealthy(u16),
    Network,
    Hang,
}

pub(crate) enum SubmitScript {
    /// Push `events` on the request's channel, then answer. `assigned`
    /// replaces the echoed correlation id.
    Respond {
        assigned: Option<CorrelationId>,
        events: Vec<String>,
    },
    /// Answer with a raw response body, decoded like the HTTP backend does.
    Body(JsonValue),
    Fail(TransportError),
    Hang,
}

impl SubmitScript {
    pub(crate) fn respond(events: Vec<String>) -> Self {
        SubmitScript::Respond {
            assigned: None,
            events,
        }
    }
}

type FrameSender = mpsc::UnboundedSender<Result<SseFrame, TransportError>>;

#[derive(Default)]
struct StreamState {
    tx: Option<FrameSender>,
    opens: u32,
    active: u32,
    max_active: u32,
}

#[derive(Default)]
struct Shared {
    streams: HashMap<CorrelationId, StreamState>,
    backlog: HashMap<CorrelationId, Vec<String>>,
    journal: Vec<String>,
}

#[derive(Default)]
pub(crate) struct FakeBackend {
    health: Mutex<VecDeque<HealthScript>>,
    submits: Mutex<VecDeque<SubmitScript>>,
    shared: Arc<Mutex<Shared>>,
    health_calls: AtomicU32,
    requests: Mutex<Vec<SubmitRequest>>,
}

/// Counts a channel as open until its stream is dropped.
struct ActiveGuard {
    shared: Arc<Mutex<Shared>>,
    id: CorrelationId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        if let Some(state) = shared.streams.get_mut(&self.id) {
            state.active -= 1;
        }
        shared.journal.push(format!("close:{}", self.id));
    }
}

pub(crate) fn event_frame(kind: &str, data: JsonValue) -> String {
    json!({ "type": kind, "timestamp": Utc::now().to_rfc3339(), "data": data }).to_string()
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_health(self, script: impl IntoIterator<Item = HealthScript>) -> Self {
        self.health.lock().unwrap().extend(script);
        self
    }

    pub(crate) fn with_submits(self, script: impl IntoIterator<Item = SubmitScript>) -> Self {
        self.submits.lock().unwrap().extend(script);
        self
    }

    /// Frames delivered as soon as a channel for `id` opens.
    pub(crate) fn with_backlog(self, id: &CorrelationId, frames: Vec<String>) -> Self {
        self.shared.lock().unwrap().backlog.insert(id.clone(), frames);
        self
    }

    pub(crate) fn push_raw(&self, id: &CorrelationId, data: &str) {
        let shared = self.shared.lock().unwrap();
        if let Some(tx) = shared.streams.get(id).and_then(|s| s.tx.as_ref()) {
            let _ = tx.send(Ok(SseFrame {
                event: None,
                data: data.to_string(),
                id: None,
            }));
        }
    }

    /// Drop the server side of the current channel for `id`.
    pub(crate) fn end_stream(&self, id: &CorrelationId) {
        if let Some(state) = self.shared.lock().unwrap().streams.get_mut(id) {
            state.tx = None;
        }
    }

    pub(crate) fn health_calls(&self) -> u32 {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<SubmitRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn opens_for(&self, id: &CorrelationId) -> u32 {
        self.shared
            .lock()
            .unwrap()
            .streams
            .get(id)
            .map_or(0, |s| s.opens)
    }

    pub(crate) fn max_concurrent(&self, id: &CorrelationId) -> u32 {
        self.shared
            .lock()
            .unwrap()
            .streams
            .get(id)
            .map_or(0, |s| s.max_active)
    }

    /// `open:<id>` / `close:<id>` in the order they happened.
    pub(crate) fn journal(&self) -> Vec<String> {
        self.shared.lock().unwrap().journal.clone()
    }

    pub(crate) fn active_streams(&self) -> u32 {
        self.shared
            .lock()
            .unwrap()
            .streams
            .values()
            .map(|s| s.active)
            .sum()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn check_health(&self, _timeout: Duration) -> Result<HealthReport, TransportError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.health.lock().unwrap().pop_front();
        match script.unwrap_or(HealthScript::Healthy) {
            HealthScript::Healthy => Ok(HealthReport::healthy()),
            HealthScript::Unhealthy(status) => Ok(HealthReport::unhealthy(status, "starting")),
            HealthScript::Network => Err(TransportError::Unreachable("connection refused".into())),
            HealthScript::Hang => std::future::pending().await,
        }
    }

    async fn submit(
        &self,
        request: &SubmitRequest,
        _timeout: Duration,
    ) -> Result<SubmitResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.submits.lock().unwrap().pop_front();
        match script.unwrap_or(SubmitScript::respond(Vec::new())) {
            SubmitScript::Hang => std::future::pending().await,
            SubmitScript::Fail(err) => Err(err),
            SubmitScript::Body(body) => serde_json::from_value::<SubmitResponse>(body)
                .map_err(|e| TransportError::Decode(e.to_string())),
            SubmitScript::Respond { assigned, events } => {
                for event in &events {
                    self.push_raw(&request.correlation_id, event);
                }
                Ok(SubmitResponse {
                    correlation_id: Some(assigned.unwrap_or_else(|| request.correlation_id.clone())),
                    result: json!({ "target": request.target }),
                })
            }
        }
    }

    async fn open_stream(&self, correlation_id: &CorrelationId) -> Result<FrameStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut shared = self.shared.lock().unwrap();
            for data in shared.backlog.remove(correlation_id).unwrap_or_default() {
                let _ = tx.send(Ok(SseFrame {
                    event: None,
                    data,
                    id: None,
                }));
            }
            let state = shared.streams.entry(correlation_id.clone()).or_default();
            state.tx = Some(tx);
            state.opens += 1;
            state.active += 1;
            state.max_active = state.max_active.max(state.active);
            shared.journal.push(format!("open:{correlation_id}"));
        }

        let guard = ActiveGuard {
            shared: Arc::clone(&self.shared),
            id: correlation_id.clone(),
        };
        let frames = UnboundedReceiverStream::new(rx).map(move |item| {
            let _held = &guard;
            item
        });
        Ok(Box::pin(frames))
    }
}
