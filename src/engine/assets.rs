//! Asset synchronization: selecting unsynced sources and mirroring one
//! source asset into a job's target namespace.

use std::path::PathBuf;

use metrics::counter;
use sea_orm::{
    ConnectionTrait, DatabaseTransaction, DbErr, FromQueryResult, TransactionTrait, Value,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::faces::mirror_faces_for_asset;
use super::{quoted, statement};
use crate::config::SyncJob;
use crate::error::{MirrorError, is_unique_violation, map_db_err};
use crate::file_mirror::{FileMirror, remap_asset_path};
use crate::models::SkipReason;
use crate::models::host::{DerivedFile, IdRow, SourceAsset};
use crate::repositories::{AssetMapRepository, FailureRepository, SkipListRepository};
use crate::schema::contract::ASSET_COPY_COLUMNS;

/// Per-cycle inputs shared by every asset in a batch.
pub struct AssetSyncContext<'a> {
    pub files: &'a FileMirror,
    /// Exif columns present in the live table, intersected with the copy allowlist.
    pub exif_columns: &'a [&'static str],
    /// Zero means unbounded retries.
    pub max_record_attempts: u32,
}

/// What happened to one source asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetOutcome {
    Synced { target_asset_id: Uuid, faces: usize },
    /// A mirror already existed at the target path; only the mapping was recreated.
    Recovered { target_asset_id: Uuid, faces: usize },
    SkippedDuplicate,
    Failed { attempts: i32, gave_up: bool },
}

enum AttemptError {
    DuplicateChecksum,
    Failed(MirrorError),
}

impl From<MirrorError> for AttemptError {
    fn from(err: MirrorError) -> Self {
        Self::Failed(err)
    }
}

/// Fully processed source assets of `job` with no mapping and no skip entry.
///
/// `exclude` holds ids that already failed in this cycle so a batch loop
/// always makes progress.
pub async fn list_unsynced_sources<C: ConnectionTrait>(
    conn: &C,
    job: &SyncJob,
    limit: u64,
    exclude: &[Uuid],
) -> Result<Vec<SourceAsset>, DbErr> {
    SourceAsset::find_by_statement(statement(
        conn,
        r#"
        SELECT a.id,
               a."ownerId" AS owner_id,
               a."originalPath" AS original_path,
               a."originalFileName" AS original_file_name
        FROM asset a
        JOIN asset_job_status ajs ON ajs."assetId" = a.id
        WHERE a."ownerId" = $1
          AND starts_with(a."originalPath", $2)
          AND a."deletedAt" IS NULL
          AND ajs."metadataExtractedAt" IS NOT NULL
          AND ajs."facesRecognizedAt" IS NOT NULL
          AND EXISTS (SELECT 1 FROM smart_search ss WHERE ss."assetId" = a.id)
          AND NOT EXISTS (SELECT 1 FROM _mirror_asset_map m WHERE m.source_asset_id = a.id)
          AND NOT EXISTS (SELECT 1 FROM _mirror_asset_map m WHERE m.target_asset_id = a.id)
          AND NOT EXISTS (SELECT 1 FROM _mirror_skipped s WHERE s.source_asset_id = a.id)
          AND NOT (a.id = ANY($3::uuid[]))
        ORDER BY a.id
        LIMIT $4
        "#,
        [
            job.source_user_id.into(),
            job.source_path_prefix.clone().into(),
            exclude.to_vec().into(),
            (limit as i64).into(),
        ],
    ))
    .all(conn)
    .await
}

/// Mirrors one source asset inside its own savepoint of `txn`.
///
/// Per-record problems are absorbed into the returned outcome. An `Err`
/// means the batch transaction itself is no longer usable.
pub async fn sync_one(
    txn: &DatabaseTransaction,
    ctx: &AssetSyncContext<'_>,
    job: &SyncJob,
    source: &SourceAsset,
) -> Result<AssetOutcome, MirrorError> {
    let savepoint = txn
        .begin()
        .await
        .map_err(|e| map_db_err("opening asset savepoint", e))?;
    let mut created: Vec<PathBuf> = Vec::new();

    let error = match mirror_asset(&savepoint, ctx, job, source, &mut created).await {
        Ok(outcome) => {
            savepoint
                .commit()
                .await
                .map_err(|e| map_db_err("releasing asset savepoint", e))?;
            FailureRepository::new(txn)
                .clear(source.id)
                .await
                .map_err(|e| map_db_err("clearing record failures", e))?;
            return Ok(outcome);
        }
        Err(error) => error,
    };

    savepoint
        .rollback()
        .await
        .map_err(|e| map_db_err("rolling back asset savepoint", e))?;
    let report = ctx.files.unmirror(&created).await;
    if !report.is_clean() {
        warn!(
            source_asset_id = %source.id,
            failed = report.failed.len(),
            "Some links created for a failed asset could not be removed"
        );
    }

    match error {
        AttemptError::DuplicateChecksum => {
            SkipListRepository::new(txn)
                .record(source.id, SkipReason::DuplicateChecksum)
                .await
                .map_err(|e| map_db_err("recording checksum skip", e))?;
            counter!("mirror_assets_skipped_total", "reason" => "duplicate_checksum").increment(1);
            warn!(
                job = %job.name,
                source_asset_id = %source.id,
                "Skipping asset: target owner already has identical content"
            );
            Ok(AssetOutcome::SkippedDuplicate)
        }
        AttemptError::Failed(err) => {
            let attempts = FailureRepository::new(txn)
                .record(source.id, &err.to_string())
                .await
                .map_err(|e| map_db_err("recording record failure", e))?;
            counter!("mirror_record_failures_total").increment(1);

            let ceiling = i32::try_from(ctx.max_record_attempts).unwrap_or(i32::MAX);
            let gave_up = ctx.max_record_attempts > 0 && attempts >= ceiling;
            if gave_up {
                SkipListRepository::new(txn)
                    .record(source.id, SkipReason::MaxAttempts)
                    .await
                    .map_err(|e| map_db_err("recording max-attempts skip", e))?;
                counter!("mirror_assets_skipped_total", "reason" => "max_attempts").increment(1);
                error!(
                    job = %job.name,
                    source_asset_id = %source.id,
                    attempts,
                    error = %err,
                    "Giving up on asset after repeated failures"
                );
            } else {
                warn!(
                    job = %job.name,
                    source_asset_id = %source.id,
                    attempts,
                    error = %err,
                    "Failed to mirror asset; will retry next cycle"
                );
            }
            Ok(AssetOutcome::Failed { attempts, gave_up })
        }
    }
}

async fn mirror_asset(
    sp: &DatabaseTransaction,
    ctx: &AssetSyncContext<'_>,
    job: &SyncJob,
    source: &SourceAsset,
    created: &mut Vec<PathBuf>,
) -> Result<AssetOutcome, AttemptError> {
    let target_path = remap_asset_path(
        &source.original_path,
        &job.source_path_prefix,
        &job.target_path_prefix,
    )
    .map_err(MirrorError::from)?;

    if let Some(existing) = find_existing_target(sp, job, &target_path).await? {
        let inserted = AssetMapRepository::new(sp)
            .insert_recovered(source.id, existing, job.source_user_id, job.target_user_id)
            .await
            .map_err(|e| map_db_err("recovering asset mapping", e))?;
        if !inserted {
            return Err(MirrorError::TargetOccupied { path: target_path }.into());
        }
        info!(
            job = %job.name,
            source_asset_id = %source.id,
            target_asset_id = %existing,
            "Recovered mapping for existing mirrored asset"
        );
        let faces = mirror_faces_for_asset(
            sp,
            ctx.files,
            source.id,
            existing,
            job.source_user_id,
            job.target_user_id,
            created,
        )
        .await?;
        return Ok(AssetOutcome::Recovered {
            target_asset_id: existing,
            faces,
        });
    }

    let target_id = Uuid::new_v4();
    insert_asset_row(sp, job, source, target_id, &target_path).await?;
    copy_exif(sp, ctx.exif_columns, source.id, target_id).await?;
    let file_count = mirror_derived_files(sp, ctx.files, job, source, target_id, created).await?;
    mark_processed(sp, target_id).await?;

    sp.execute(statement(
        sp,
        r#"
        INSERT INTO smart_search ("assetId", embedding)
        SELECT $1, embedding FROM smart_search WHERE "assetId" = $2
        "#,
        [target_id.into(), source.id.into()],
    ))
    .await
    .map_err(|e| map_db_err("copying search embedding", e))?;

    AssetMapRepository::new(sp)
        .insert(source.id, target_id, job.source_user_id, job.target_user_id)
        .await
        .map_err(|e| map_db_err("recording asset mapping", e))?;

    let faces = mirror_faces_for_asset(
        sp,
        ctx.files,
        source.id,
        target_id,
        job.source_user_id,
        job.target_user_id,
        created,
    )
    .await?;

    info!(
        job = %job.name,
        source_asset_id = %source.id,
        target_asset_id = %target_id,
        file_name = %source.original_file_name,
        files = file_count,
        faces,
        "Mirrored asset"
    );
    Ok(AssetOutcome::Synced {
        target_asset_id: target_id,
        faces,
    })
}

async fn find_existing_target(
    sp: &DatabaseTransaction,
    job: &SyncJob,
    target_path: &str,
) -> Result<Option<Uuid>, MirrorError> {
    let row = IdRow::find_by_statement(statement(
        sp,
        r#"
        SELECT id FROM asset
        WHERE "ownerId" = $1 AND "libraryId" = $2 AND "originalPath" = $3 AND "deletedAt" IS NULL
        LIMIT 1
        "#,
        [
            job.target_user_id.into(),
            job.target_library_id.into(),
            target_path.to_string().into(),
        ],
    ))
    .one(sp)
    .await
    .map_err(|e| map_db_err("looking up existing mirror", e))?;
    Ok(row.map(|row| row.id))
}

/// Copies the source row, resetting per-user fields (favorite, stack,
/// duplicate group, live-photo link) and placing it in the job's library.
async fn insert_asset_row(
    sp: &DatabaseTransaction,
    job: &SyncJob,
    source: &SourceAsset,
    target_id: Uuid,
    target_path: &str,
) -> Result<(), AttemptError> {
    let target_cols = ASSET_COPY_COLUMNS
        .iter()
        .map(|c| quoted(c))
        .collect::<Vec<_>>()
        .join(", ");
    let source_cols = ASSET_COPY_COLUMNS
        .iter()
        .map(|c| format!("a.{}", quoted(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        r#"
        INSERT INTO asset (
            id, "ownerId", "originalPath", "isFavorite", "livePhotoVideoId",
            "libraryId", "isExternal", "stackId", "duplicateId", {target_cols}
        )
        SELECT $1, $2, $3, false, NULL, $4, true, NULL, NULL, {source_cols}
        FROM asset a
        WHERE a.id = $5 AND a."ownerId" = $6 AND a."deletedAt" IS NULL
        "#
    );
    let values: [Value; 6] = [
        target_id.into(),
        job.target_user_id.into(),
        target_path.to_string().into(),
        job.target_library_id.into(),
        source.id.into(),
        job.source_user_id.into(),
    ];

    match sp.execute(statement(sp, &sql, values)).await {
        Ok(result) if result.rows_affected() == 0 => {
            Err(MirrorError::SourceVanished(source.id).into())
        }
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => Err(AttemptError::DuplicateChecksum),
        Err(err) => Err(map_db_err("inserting mirrored asset", err).into()),
    }
}

async fn copy_exif(
    sp: &DatabaseTransaction,
    exif_columns: &[&'static str],
    source_id: Uuid,
    target_id: Uuid,
) -> Result<(), MirrorError> {
    let cols = exif_columns
        .iter()
        .map(|c| quoted(c))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = if cols.is_empty() {
        r#"INSERT INTO asset_exif ("assetId") SELECT $1 FROM asset_exif WHERE "assetId" = $2"#
            .to_string()
    } else {
        format!(
            r#"INSERT INTO asset_exif ("assetId", {cols}) SELECT $1, {cols} FROM asset_exif WHERE "assetId" = $2"#
        )
    };
    sp.execute(statement(sp, &sql, [target_id.into(), source_id.into()]))
        .await
        .map_err(|e| map_db_err("copying exif metadata", e))?;
    Ok(())
}

/// Hardlinks each derived file and records it for the mirror. Files that
/// cannot be linked are skipped, not fatal.
async fn mirror_derived_files(
    sp: &DatabaseTransaction,
    files: &FileMirror,
    job: &SyncJob,
    source: &SourceAsset,
    target_id: Uuid,
    created: &mut Vec<PathBuf>,
) -> Result<usize, MirrorError> {
    let rows = DerivedFile::find_by_statement(statement(
        sp,
        r#"SELECT id, path FROM asset_file WHERE "assetId" = $1 ORDER BY id"#,
        [source.id.into()],
    ))
    .all(sp)
    .await
    .map_err(|e| map_db_err("loading derived files", e))?;

    let mut mirrored = 0;
    for file in rows {
        let outcome = match files
            .mirror(
                &file.path,
                source.owner_id,
                job.target_user_id,
                source.id,
                target_id,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    source_asset_id = %source.id,
                    path = %file.path,
                    error = %err,
                    "Skipping derived file"
                );
                continue;
            }
        };
        if outcome.created() {
            created.push(outcome.path().to_path_buf());
        }

        sp.execute(statement(
            sp,
            r#"
            INSERT INTO asset_file (id, "assetId", type, path, "isEdited", "isProgressive")
            SELECT $1, $2, f.type, $3, f."isEdited", f."isProgressive"
            FROM asset_file f WHERE f.id = $4
            "#,
            [
                Uuid::new_v4().into(),
                target_id.into(),
                outcome.path().to_string_lossy().into_owned().into(),
                file.id.into(),
            ],
        ))
        .await
        .map_err(|e| map_db_err("recording mirrored file", e))?;
        debug!(path = %outcome.path().display(), "Recorded mirrored file");
        mirrored += 1;
    }
    Ok(mirrored)
}

/// Marks every host pipeline step done so the host never re-queues the mirror.
async fn mark_processed(sp: &DatabaseTransaction, target_id: Uuid) -> Result<(), MirrorError> {
    sp.execute(statement(
        sp,
        r#"
        INSERT INTO asset_job_status
            ("assetId", "facesRecognizedAt", "metadataExtractedAt", "duplicatesDetectedAt", "ocrAt")
        VALUES ($1, now(), now(), now(), now())
        "#,
        [target_id.into()],
    ))
    .await
    .map_err(|e| map_db_err("marking mirror processed", e))?;
    Ok(())
}
