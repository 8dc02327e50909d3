//! HTTP API: liveness, audit submission and per-correlation-id progress streams.

pub mod app;
pub mod config;
