use anyhow::Context;

use auditrelay_api::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    auditrelay_observability::init();

    let config = ServerConfig::from_env();
    if !config.warmup.is_zero() {
        tracing::info!(warmup_secs = config.warmup.as_secs(), "reporting not-ready during warmup");
    }
    let bind = config.bind.clone();

    let app = auditrelay_api::app::build_app(config);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
