//! `auditrelay-pipeline`
//!
//! **Responsibility:** run the fixed sequence of analysis stages for one audit
//! and report progress as [`ProgressEvent`](auditrelay_core::ProgressEvent)s.
//!
//! What a stage actually computes is supplied by an [`Analyzer`]. This crate
//! owns only the control flow around it:
//! - classifying upstream failures (quota exhaustion, rate limiting, fatal)
//! - deciding how long to wait before retrying a stage
//! - emitting `audit_started`, retry, `retry_complete`, `audit_completed` and
//!   `audit_error` events to a [`ProgressSink`]

pub mod analyzer;
pub mod retry;
pub mod runner;
pub mod sink;
pub mod upstream;

pub use analyzer::{Analyzer, OfflineAnalyzer, StageInput};
pub use retry::{RetryPlan, StageRetryPolicy};
pub use runner::{DEFAULT_STAGES, PipelineError, PipelineRunner};
pub use sink::{CollectingSink, ProgressSink};
pub use upstream::UpstreamError;
