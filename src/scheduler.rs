//! # Sync Scheduler
//!
//! Drives the engine: one cycle immediately, then one per configured interval
//! until shutdown. A failed cycle is logged and retried on the next tick; it
//! never stops the loop.

use std::collections::HashSet;
use std::sync::Arc;

use metrics::{counter, histogram};
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::engine::MirrorEngine;
use crate::error::MirrorError;
use crate::host_api::HostApiClient;

pub struct MirrorScheduler {
    config: Arc<AppConfig>,
    engine: MirrorEngine,
    host: Option<HostApiClient>,
}

impl MirrorScheduler {
    pub fn new(config: Arc<AppConfig>, engine: MirrorEngine, host: Option<HostApiClient>) -> Self {
        Self {
            config,
            engine,
            host,
        }
    }

    /// Library ids that are mirror targets and must never be scanned.
    fn target_libraries(&self) -> HashSet<Uuid> {
        self.config
            .jobs
            .iter()
            .map(|job| job.target_library_id)
            .collect()
    }

    /// Run the loop until the shutdown token fires. An in-flight cycle stops
    /// at its next phase or batch boundary.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.config.sync.interval_seconds);
        info!(
            interval_seconds = self.config.sync.interval_seconds,
            jobs = self.config.jobs.len(),
            "Starting mirror scheduler"
        );

        loop {
            self.tick(&shutdown).await;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Mirror scheduler shutdown requested");
                    break;
                }
                _ = sleep(interval) => {}
            }
        }

        info!("Mirror scheduler stopped");
    }

    async fn tick(&self, shutdown: &CancellationToken) {
        if self.config.sync.scan_libraries
            && let Some(host) = &self.host
            && let Err(err) = host.scan_libraries_except(&self.target_libraries()).await
        {
            warn!(error = %err, "Library scan trigger failed");
        }

        let started = Instant::now();
        let result = self.engine.run_cycle(shutdown).await;
        histogram!("mirror_cycle_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        match result {
            Ok(_) => {}
            Err(MirrorError::Cancelled) => info!("Sync cycle interrupted by shutdown"),
            Err(err) => {
                counter!("mirror_cycle_failures_total").increment(1);
                error!(error = %err, "Sync cycle failed");
            }
        }
    }
}
