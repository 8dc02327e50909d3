//! Caller-owned, append-only activity log.
//!
//! Components never write to ambient state; they are handed an
//! [`ActivityLog`] and append to it. Every entry is mirrored to `tracing`.
//! Presentation code can take a [`ActivityLog::snapshot`] or
//! [`ActivityLog::subscribe`] to render entries as they arrive.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::probe::ProbeAttempt;

/// Which part of the relay produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Probe,
    Submission,
    Stream,
    Progress,
    Job,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
    pub level: LogLevel,
    pub message: String,
    /// One-based attempt index, for retry-loop entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Wait scheduled after this entry, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
    /// The classified liveness check this entry reports on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeAttempt>,
}

impl LogEntry {
    pub fn new(source: LogSource, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source,
            level,
            message: message.into(),
            attempt: None,
            wait_ms: None,
            probe: None,
        }
    }

    pub fn info(source: LogSource, message: impl Into<String>) -> Self {
        Self::new(source, LogLevel::Info, message)
    }

    pub fn warn(source: LogSource, message: impl Into<String>) -> Self {
        Self::new(source, LogLevel::Warn, message)
    }

    pub fn error(source: LogSource, message: impl Into<String>) -> Self {
        Self::new(source, LogLevel::Error, message)
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait_ms = Some(wait.as_millis() as u64);
        self
    }

    /// Attach a probe record; also sets `attempt` to its sequence number.
    pub fn with_probe(mut self, probe: ProbeAttempt) -> Self {
        self.attempt = Some(probe.sequence);
        self.probe = Some(probe);
        self
    }
}

impl core::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "[{}] {:?}/{:?}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.source,
            self.level,
            self.message
        )
    }
}

/// Shared handle to one append-only log. Cloning shares the same log.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
    live: broadcast::Sender<LogEntry>,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            live,
        }
    }

    pub fn append(&self, entry: LogEntry) {
        match entry.level {
            LogLevel::Info => tracing::info!(
                source = ?entry.source,
                attempt = ?entry.attempt,
                wait_ms = ?entry.wait_ms,
                probe = ?entry.probe.as_ref().map(|p| &p.outcome),
                "{}",
                entry.message
            ),
            LogLevel::Warn => tracing::warn!(
                source = ?entry.source,
                attempt = ?entry.attempt,
                wait_ms = ?entry.wait_ms,
                probe = ?entry.probe.as_ref().map(|p| &p.outcome),
                "{}",
                entry.message
            ),
            LogLevel::Error => tracing::error!(
                source = ?entry.source,
                attempt = ?entry.attempt,
                wait_ms = ?entry.wait_ms,
                probe = ?entry.probe.as_ref().map(|p| &p.outcome),
                "{}",
                entry.message
            ),
        }

        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry.clone());

        // Lossy for slow renderers; the snapshot stays complete.
        let _ = self.live.send(entry);
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Entries from one source, in append order.
    pub fn from_source(&self, source: LogSource) -> Vec<LogEntry> {
        self.snapshot()
            .into_iter()
            .filter(|e| e.source == source)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive entries appended after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.live.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeOutcome;

    #[test]
    fn clones_share_one_log() {
        let log = ActivityLog::new();
        let other = log.clone();

        log.append(LogEntry::info(LogSource::Probe, "one"));
        other.append(LogEntry::warn(LogSource::Submission, "two").with_attempt(2));

        let entries = log.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "one");
        assert_eq!(entries[1].attempt, Some(2));
        assert_eq!(log.from_source(LogSource::Submission).len(), 1);
    }

    #[tokio::test]
    async fn subscribers_see_new_entries() {
        let log = ActivityLog::new();
        log.append(LogEntry::info(LogSource::Job, "before"));

        let mut rx = log.subscribe();
        log.append(LogEntry::info(LogSource::Job, "after").with_wait(Duration::from_millis(1500)));

        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.message, "after");
        assert_eq!(entry.wait_ms, Some(1500));
    }

    #[test]
    fn probe_entries_carry_the_attempt_record() {
        let attempt = ProbeAttempt {
            sequence: 2,
            started_at: Utc::now(),
            outcome: ProbeOutcome::HttpError {
                status: 503,
                detail: None,
            },
            latency: Duration::from_millis(40),
        };
        let entry = LogEntry::warn(LogSource::Probe, "not ready").with_probe(attempt.clone());

        assert_eq!(entry.attempt, Some(2));
        assert_eq!(entry.probe, Some(attempt));

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["probe"]["outcome"]["kind"], "http_error");
        assert_eq!(json["probe"]["outcome"]["status"], 503);
        assert!(serde_json::to_value(LogEntry::info(LogSource::Job, "x")).unwrap()["probe"].is_null());
    }
}
