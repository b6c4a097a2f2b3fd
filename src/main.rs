//! # Immich Mirror Service Entry Point

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use immich_mirror::{
    config::ConfigLoader,
    db,
    engine::{MirrorEngine, preflight::validate_job_references},
    host_api::HostApiClient,
    scheduler::MirrorScheduler,
    schema,
    server::run_health_server,
    telemetry,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigLoader::new().load().context("Loading configuration")?;
    config
        .validate_for_service()
        .context("Invalid service configuration")?;
    let config = Arc::new(config);

    telemetry::init_tracing(&config).context("Initializing telemetry")?;
    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted) = config.redacted_json() {
        info!(config = %redacted, "Effective configuration");
    }

    let host = HostApiClient::from_config(&config).context("Building host API client")?;
    host.wait_for_host(
        config.sync.host_wait_attempts,
        Duration::from_secs(config.sync.host_wait_delay_seconds),
    )
    .await
    .context("Waiting for host API")?;

    let pool = db::init_pool(&config).await?;
    db::ensure_tracking_tables(&pool).await?;

    schema::validate(&pool, &config.schema)
        .await
        .context("Host schema does not satisfy the mirror contract")?;
    validate_job_references(&pool, &config.jobs)
        .await
        .context("Sync job validation failed")?;

    let shutdown = CancellationToken::new();
    let health_addr = config.health_addr().context("Invalid health bind address")?;
    let health = tokio::spawn(run_health_server(health_addr, shutdown.clone()));

    let engine = MirrorEngine::new(pool.clone(), Arc::clone(&config));
    let scheduler = MirrorScheduler::new(Arc::clone(&config), engine, Some(host));
    let sync = tokio::spawn(scheduler.run(shutdown.clone()));

    wait_for_signal().await;
    info!("Shutdown signal received");
    shutdown.cancel();

    if let Err(err) = sync.await {
        error!(error = %err, "Sync task panicked");
    }
    match health.await {
        Ok(Err(err)) => error!(error = %err, "Health endpoint failed"),
        Err(err) => error!(error = %err, "Health task panicked"),
        Ok(Ok(())) => {}
    }

    db::close(pool).await;
    info!("Stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                error!(error = %err, "Cannot listen for SIGTERM; only Ctrl-C stops the service");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
