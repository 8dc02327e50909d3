//! Tracing/logging setup shared by the relay binaries.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Like [`init`], for command-line tools: logs go to stderr and the activity
/// log mirror is filtered out unless `RUST_LOG` asks for it.
pub fn init_cli() {
    tracing::init_cli();
}

/// Tracing configuration (filters, layers, output format).
pub mod tracing;

pub use self::tracing::{CLI_DEFAULT_FILTER, LogFormat, LogWriter};
