use anyhow::Context;
use inference_core::telemetry::init_tracing;
use inference_core::{Config, InferenceService};
use std::time::Duration;
use tracing::info;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => Config::default(),
    }
    .from_env();
    config.validate()?;

    init_tracing(&config.logging);
    info!(
        "Starting inference core against {} with {} configured model(s)",
        config.backend.base_url,
        config.models.len()
    );

    let service = InferenceService::connect(config)?;
    service
        .start()
        .await
        .context("starting inference service")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    service.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}
