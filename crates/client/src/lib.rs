//! `auditrelay-client` — resilient job submission and progress streaming.
//!
//! If you're new to this crate, it is structured like:
//! - `transport.rs`: the [`Backend`] seam (liveness, submission, progress channel)
//! - `http.rs`: the reqwest implementation of that seam
//! - `sse.rs`: server-sent-events frame decoding
//! - `prober.rs`: readiness probing before work is submitted
//! - `stream.rs`: the per-correlation-id progress consumer
//! - `orchestrator.rs`: the end-to-end submission flow
//! - `config.rs`: environment-driven settings

pub mod config;
pub mod http;
pub mod orchestrator;
pub mod prober;
pub mod sse;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ClientConfig;
pub use http::HttpBackend;
pub use orchestrator::{AuditHandle, AuditOrchestrator, AuditReport, JobContext};
pub use prober::{ProbeReport, Readiness, ReadinessProber};
pub use sse::{SseDecoder, SseFrame};
pub use stream::{EventStreamConsumer, ProgressFeed, ProgressSender, StreamRegistry, progress_channel};
pub use transport::{Backend, FrameStream, HealthReport, SubmitRequest, SubmitResponse, TransportError};
