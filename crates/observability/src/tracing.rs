//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Output format of the process log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line, for collectors.
    #[default]
    Json,
    /// Human-readable lines, for terminals.
    Pretty,
}

impl LogFormat {
    /// Read `AUDITRELAY_LOG_FORMAT` (`json` | `pretty`); unknown values mean JSON.
    pub fn from_env() -> Self {
        match std::env::var("AUDITRELAY_LOG_FORMAT") {
            Ok(v) => Self::parse(&v),
            Err(_) => Self::default(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" | "human" => Self::Pretty,
            _ => Self::Json,
        }
    }
}

/// Directives used by command-line tools when `RUST_LOG` is unset. The
/// activity log is rendered by the tool itself, so its `tracing` mirror is off.
pub const CLI_DEFAULT_FILTER: &str = "info,auditrelay_core::log=off";

/// Where log lines are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogWriter {
    #[default]
    Stdout,
    /// Keeps stdout free for program output.
    Stderr,
}

/// Initialize tracing/logging for the process, format taken from the environment.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with(LogFormat::from_env());
}

/// Setup for command-line tools: stderr, activity log mirror filtered out.
pub fn init_cli() {
    install(LogFormat::from_env(), LogWriter::Stderr, CLI_DEFAULT_FILTER);
}

pub fn init_with(format: LogFormat) {
    install(format, LogWriter::Stdout, "info");
}

fn install(format: LogFormat, writer: LogWriter, default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let writer = match writer {
        LogWriter::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogWriter::Stderr => BoxMakeWriter::new(std::io::stderr),
    };

    // Timestamps + filter configurable via RUST_LOG.
    let _ = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn format_parsing_defaults_to_json() {
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(" Text "), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
    }

    #[test]
    fn init_is_idempotent() {
        init_with(LogFormat::Pretty);
        init_with(LogFormat::Json);
        init_cli();
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn cli_filter_drops_activity_log_mirror() {
        let capture = Capture::default();
        let sink = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(CLI_DEFAULT_FILTER))
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .finish();

        ::tracing::subscriber::with_default(subscriber, || {
            ::tracing::info!(target: "auditrelay_core::log", "mirrored entry");
            ::tracing::info!(target: "auditrelay_client::stream", "channel event");
        });

        let written = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(!written.contains("mirrored entry"));
        assert!(written.contains("channel event"));
    }
}
