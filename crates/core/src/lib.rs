//! `auditrelay-core` — shared building blocks for the audit relay.
//!
//! This crate is **pure**: no network IO. It holds the types every other crate
//! speaks (identifiers, the error taxonomy, backoff math, progress events, the
//! caller-owned activity log and the job state machine).

pub mod backoff;
pub mod error;
pub mod event;
pub mod id;
pub mod job;
pub mod log;
pub mod probe;
pub mod target;

pub use backoff::{BackoffPolicy, Jitter};
pub use error::{AuditError, AuditResult, TransitionError};
pub use event::{EventBody, FrameError, ProgressEvent, RetryEventPayload, WaitSource};
pub use id::{CorrelationId, JobId};
pub use job::{AuditJob, JobStatus};
pub use log::{ActivityLog, LogEntry, LogLevel, LogSource};
pub use probe::{ProbeAttempt, ProbeOutcome};
pub use target::AuditTarget;
