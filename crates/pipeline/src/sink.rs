//! Where pipeline progress events go.

use std::sync::Mutex;

use auditrelay_core::ProgressEvent;

/// Receiver of progress events for one audit.
///
/// Emission must not block the pipeline: implementations should be lossy
/// rather than apply backpressure.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Wire kinds, in order.
    pub fn kinds(&self) -> Vec<String> {
        self.events().iter().map(|e| e.kind().to_string()).collect()
    }
}

impl ProgressSink for CollectingSink {
    fn emit(&self, event: ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}
