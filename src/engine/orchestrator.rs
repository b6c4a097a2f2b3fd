//! # Sync Orchestrator
//!
//! Runs one cycle as a fixed sequence of phases:
//!
//! 1. schema contract check
//! 2. per-job batched asset sync (duplicates skipped, faces mirrored)
//! 3. album assignment and backfill
//! 4. incremental face sync
//! 5. person metadata sync
//! 6. cleanup of deleted assets, reassigned faces and orphaned persons
//!
//! Each phase (and each asset batch) commits in its own transaction with a
//! statement timeout, and is bounded by a wall-clock timeout. Cancellation is
//! observed between phases and between batches, never inside one.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::assets::{AssetOutcome, AssetSyncContext, list_unsynced_sources, sync_one};
use super::duplicates::{detect_duplicates, record_duplicates};
use super::{albums, cleanup, faces, persons};
use crate::config::{AppConfig, SyncJob};
use crate::db::set_statement_timeout;
use crate::error::{MirrorError, map_db_err};
use crate::file_mirror::FileMirror;
use crate::schema::{self, SchemaSnapshot, contract::EXIF_COPY_COLUMNS};

/// Aggregate counts for one cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub assets_synced: u64,
    pub assets_recovered: u64,
    pub duplicates_skipped: u64,
    pub checksum_skipped: u64,
    pub record_failures: u64,
    pub faces_synced: u64,
    pub album_assets_added: u64,
    pub persons_updated: u64,
    pub assets_cleaned: u64,
    pub faces_reassigned: u64,
    pub persons_cleaned: u64,
}

impl CycleSummary {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Default)]
struct BatchResult {
    fetched: usize,
    mirrored: Vec<Uuid>,
    recovered: u64,
    duplicates: u64,
    checksum_skipped: u64,
    failed: Vec<Uuid>,
    faces: u64,
}

/// The reconciliation engine. Cheap to clone.
#[derive(Clone)]
pub struct MirrorEngine {
    db: DatabaseConnection,
    config: Arc<AppConfig>,
    files: FileMirror,
}

impl MirrorEngine {
    pub fn new(db: DatabaseConnection, config: Arc<AppConfig>) -> Self {
        let files = FileMirror::new(&config.storage);
        Self { db, config, files }
    }

    /// Runs one full cycle. Re-running with no upstream changes is a no-op.
    #[instrument(skip_all)]
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary, MirrorError> {
        let mut summary = CycleSummary::default();

        ensure_running(cancel)?;
        let snapshot = match self.bounded("schema", self.check_schema()).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                if matches!(err, MirrorError::Schema(_)) {
                    counter!("mirror_schema_violations_total").increment(1);
                }
                return Err(err);
            }
        };
        let exif_columns: Vec<&'static str> = EXIF_COPY_COLUMNS
            .iter()
            .copied()
            .filter(|column| snapshot.has_column("asset_exif", column))
            .collect();

        let mut mirrored_by_job: Vec<(&SyncJob, Vec<Uuid>)> = Vec::new();
        for job in &self.config.jobs {
            let mirrored = self
                .sync_job_assets(job, &exif_columns, cancel, &mut summary)
                .await?;
            mirrored_by_job.push((job, mirrored));
        }
        counter!("mirror_assets_synced_total").increment(summary.assets_synced);
        counter!("mirror_assets_skipped_total", "reason" => "duplicate_filename")
            .increment(summary.duplicates_skipped);

        ensure_running(cancel)?;
        summary.album_assets_added = self
            .bounded("albums", self.assign_albums(&mirrored_by_job))
            .await?;

        ensure_running(cancel)?;
        summary.faces_synced += self
            .bounded("incremental_faces", self.sync_faces())
            .await?;

        ensure_running(cancel)?;
        summary.persons_updated = self
            .bounded("person_metadata", self.sync_person_metadata())
            .await?;

        ensure_running(cancel)?;
        self.bounded("cleanup", self.cleanup(&mut summary)).await?;

        if summary.is_empty() {
            debug!("Sync cycle complete: nothing to do");
        } else {
            info!(
                assets_synced = summary.assets_synced,
                assets_recovered = summary.assets_recovered,
                duplicates_skipped = summary.duplicates_skipped,
                checksum_skipped = summary.checksum_skipped,
                record_failures = summary.record_failures,
                faces_synced = summary.faces_synced,
                album_assets_added = summary.album_assets_added,
                persons_updated = summary.persons_updated,
                assets_cleaned = summary.assets_cleaned,
                faces_reassigned = summary.faces_reassigned,
                persons_cleaned = summary.persons_cleaned,
                "Sync cycle complete"
            );
        }
        Ok(summary)
    }

    async fn begin(&self) -> Result<DatabaseTransaction, MirrorError> {
        let txn = self
            .db
            .begin()
            .await
            .map_err(|e| map_db_err("beginning phase transaction", e))?;
        set_statement_timeout(&txn, self.config.sync.statement_timeout_ms)
            .await
            .map_err(|e| map_db_err("setting statement timeout", e))?;
        Ok(txn)
    }

    async fn bounded<T>(
        &self,
        phase: &'static str,
        work: impl Future<Output = Result<T, MirrorError>>,
    ) -> Result<T, MirrorError> {
        let seconds = self.config.sync.phase_timeout_seconds;
        match tokio::time::timeout(Duration::from_secs(seconds), work).await {
            Ok(result) => result,
            // Dropping the future drops its open transaction, which rolls back.
            Err(_) => Err(MirrorError::Timeout { phase, seconds }),
        }
    }

    async fn check_schema(&self) -> Result<SchemaSnapshot, MirrorError> {
        let txn = self.begin().await?;
        let snapshot = schema::validate(&txn, &self.config.schema).await?;
        commit(txn).await?;
        Ok(snapshot)
    }

    async fn sync_job_assets(
        &self,
        job: &SyncJob,
        exif_columns: &[&'static str],
        cancel: &CancellationToken,
        summary: &mut CycleSummary,
    ) -> Result<Vec<Uuid>, MirrorError> {
        let ctx = AssetSyncContext {
            files: &self.files,
            exif_columns,
            max_record_attempts: self.config.sync.max_record_attempts,
        };
        let batch_size = self.config.sync.batch_size;
        let mut failed: Vec<Uuid> = Vec::new();
        let mut mirrored = Vec::new();

        loop {
            ensure_running(cancel)?;
            let mut batch = self
                .bounded("assets", self.sync_batch(job, &ctx, &failed))
                .await?;

            summary.assets_synced += batch.mirrored.len() as u64;
            summary.assets_recovered += batch.recovered;
            summary.duplicates_skipped += batch.duplicates;
            summary.checksum_skipped += batch.checksum_skipped;
            summary.record_failures += batch.failed.len() as u64;
            summary.faces_synced += batch.faces;
            mirrored.append(&mut batch.mirrored);
            failed.append(&mut batch.failed);

            debug!(job = %job.name, fetched = batch.fetched, "Asset batch committed");
            if (batch.fetched as u64) < batch_size {
                break;
            }
        }
        Ok(mirrored)
    }

    async fn sync_batch(
        &self,
        job: &SyncJob,
        ctx: &AssetSyncContext<'_>,
        failed: &[Uuid],
    ) -> Result<BatchResult, MirrorError> {
        let txn = self.begin().await?;
        let sources = list_unsynced_sources(&txn, job, self.config.sync.batch_size, failed)
            .await
            .map_err(|e| map_db_err("loading unsynced sources", e))?;

        let duplicates = detect_duplicates(&txn, &sources, job, self.config.sync.duplicate_match)
            .await?;
        record_duplicates(&txn, &duplicates).await?;
        let duplicates: HashSet<Uuid> = duplicates.into_iter().collect();

        let mut result = BatchResult {
            fetched: sources.len(),
            duplicates: duplicates.len() as u64,
            ..BatchResult::default()
        };
        for source in sources.iter().filter(|s| !duplicates.contains(&s.id)) {
            match sync_one(&txn, ctx, job, source).await? {
                AssetOutcome::Synced {
                    target_asset_id,
                    faces,
                } => {
                    result.mirrored.push(target_asset_id);
                    result.faces += faces as u64;
                }
                AssetOutcome::Recovered { faces, .. } => {
                    result.recovered += 1;
                    result.faces += faces as u64;
                }
                AssetOutcome::SkippedDuplicate => result.checksum_skipped += 1,
                AssetOutcome::Failed { .. } => result.failed.push(source.id),
            }
        }

        commit(txn).await?;
        Ok(result)
    }

    async fn assign_albums(&self, mirrored_by_job: &[(&SyncJob, Vec<Uuid>)]) -> Result<u64, MirrorError> {
        if mirrored_by_job.iter().all(|(job, _)| job.album_id.is_none()) {
            return Ok(0);
        }
        let txn = self.begin().await?;
        let mut added = 0;
        for (job, mirrored) in mirrored_by_job {
            added += albums::add_assets_to_album(&txn, job, mirrored).await?;
            added += albums::backfill_album(&txn, job).await?;
        }
        commit(txn).await?;
        Ok(added)
    }

    async fn sync_faces(&self) -> Result<u64, MirrorError> {
        let txn = self.begin().await?;
        let mut created: Vec<PathBuf> = Vec::new();
        let result = faces::sync_incremental_faces(&txn, &self.files, &mut created).await;
        let count = self.finish(txn, result, &created).await?;
        Ok(count as u64)
    }

    async fn sync_person_metadata(&self) -> Result<u64, MirrorError> {
        let txn = self.begin().await?;
        let mut created: Vec<PathBuf> = Vec::new();
        let result = async {
            let names = persons::sync_names(&txn).await?;
            let visibility = persons::sync_visibility(&txn).await?;
            let thumbnails = persons::sync_thumbnails(&txn, &self.files, &mut created).await?;
            Ok::<_, MirrorError>(names + visibility + thumbnails)
        }
        .await;
        self.finish(txn, result, &created).await
    }

    async fn cleanup(&self, summary: &mut CycleSummary) -> Result<(), MirrorError> {
        let txn = self.begin().await?;
        let mut created: Vec<PathBuf> = Vec::new();
        let result = async {
            let assets = cleanup::cleanup_deleted_assets(&txn, &self.files).await?;
            let faces = cleanup::cleanup_reassigned_faces(&txn, &self.files, &mut created).await?;
            let persons = cleanup::cleanup_orphaned_persons(&txn).await?;
            Ok::<_, MirrorError>((assets, faces, persons))
        }
        .await;
        let (assets, faces, persons) = self.finish(txn, result, &created).await?;

        let thumbnails: Vec<&str> = persons
            .iter()
            .map(|p| p.thumbnail_path.as_str())
            .filter(|path| !path.is_empty())
            .collect();
        self.files.unmirror(&thumbnails).await;

        summary.assets_cleaned = assets;
        summary.faces_reassigned = faces;
        summary.persons_cleaned = persons.len() as u64;
        Ok(())
    }

    /// Commits on success. On failure rolls back and removes links the phase created.
    async fn finish<T>(
        &self,
        txn: DatabaseTransaction,
        result: Result<T, MirrorError>,
        created: &[PathBuf],
    ) -> Result<T, MirrorError> {
        match result {
            Ok(value) => {
                commit(txn).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    tracing::warn!(error = %rollback_err, "Phase rollback failed");
                }
                self.files.unmirror(created).await;
                Err(err)
            }
        }
    }
}

async fn commit(txn: DatabaseTransaction) -> Result<(), MirrorError> {
    txn.commit()
        .await
        .map_err(|e| map_db_err("committing phase transaction", e))
}

fn ensure_running(cancel: &CancellationToken) -> Result<(), MirrorError> {
    if cancel.is_cancelled() {
        return Err(MirrorError::Cancelled);
    }
    Ok(())
}
