use std::sync::Arc;

use anyhow::Context;
use auditrelay_client::{AuditOrchestrator, ClientConfig};
use auditrelay_core::ActivityLog;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    auditrelay_observability::init_cli();

    let target = std::env::args()
        .nth(1)
        .context("usage: auditrelay <url-or-domain>")?;

    let config = ClientConfig::from_env();
    tracing::info!(backend = %config.backend_url, "using audit backend");
    let orchestrator = Arc::new(
        AuditOrchestrator::connect(config).context("failed to build HTTP client")?,
    );

    let log = ActivityLog::new();
    let mut entries = log.subscribe();
    let log_printer = tokio::spawn(async move {
        loop {
            match entries.recv().await {
                Ok(entry) => eprintln!("{entry}"),
                Err(RecvError::Lagged(skipped)) => eprintln!("... {skipped} log entries skipped"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    let mut handle = orchestrator.spawn(&target, log);

    let printer = handle.take_progress().map(|mut feed| {
        tokio::spawn(async move {
            while let Some(event) = feed.recv().await {
                println!("{}", event.to_frame());
            }
        })
    });

    let outcome = tokio::select! {
        outcome = handle.outcome() => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted; cancelling audit");
            handle.cancel();
            handle.outcome().await
        }
    };

    if let Some(printer) = printer {
        let _ = printer.await;
    }
    log_printer.abort();

    let report = outcome.context("audit failed")?;
    println!("{}", serde_json::to_string_pretty(&report.result)?);
    Ok(())
}
