//! Filename-stem and capture-time duplicate detection against the target
//! owner's own uploads.
//!
//! A source asset only counts as a duplicate when it has an original capture
//! timestamp; without one there is no evidence. Matches are compared on the
//! wall-clock capture time the host stores in `localDateTime`.

use sea_orm::{ConnectionTrait, FromQueryResult};
use uuid::Uuid;

use super::statement;
use crate::config::{DuplicateMatch, SyncJob};
use crate::error::{MirrorError, map_db_err};
use crate::models::SkipReason;
use crate::models::host::{IdRow, SourceAsset};
use crate::repositories::SkipListRepository;

/// SQL expression for a file name without its last extension.
pub(crate) fn stem_sql(file_name: &str) -> String {
    format!(r#"regexp_replace({file_name}, '\.[^.]+$', '')"#)
}

/// SQL expression for the capture key of asset alias `asset`.
pub(crate) fn capture_key_sql(mode: DuplicateMatch, asset: &str) -> String {
    match mode {
        DuplicateMatch::Date => format!(r#"({asset}."localDateTime" AT TIME ZONE 'UTC')::date"#),
        DuplicateMatch::Exact => {
            format!(r#"date_trunc('second', {asset}."localDateTime" AT TIME ZONE 'UTC')"#)
        }
    }
}

/// Returns the ids in `sources` that collide with an upload the target owner
/// made outside the job's library.
pub async fn detect_duplicates<C: ConnectionTrait>(
    conn: &C,
    sources: &[SourceAsset],
    job: &SyncJob,
    mode: DuplicateMatch,
) -> Result<Vec<Uuid>, MirrorError> {
    if sources.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<Uuid> = sources.iter().map(|s| s.id).collect();

    let sql = format!(
        r#"
        WITH candidates AS (
            SELECT a.id,
                   {source_stem} AS stem,
                   {source_key} AS capture
            FROM asset a
            JOIN asset_exif e ON e."assetId" = a.id
            WHERE a.id = ANY($1::uuid[])
              AND e."dateTimeOriginal" IS NOT NULL
        )
        SELECT DISTINCT c.id
        FROM candidates c
        JOIN asset o
          ON o."ownerId" = $2
         AND o."libraryId" IS DISTINCT FROM $3
         AND o."deletedAt" IS NULL
         AND {own_stem} = c.stem
         AND {own_key} = c.capture
        JOIN asset_exif oe ON oe."assetId" = o.id AND oe."dateTimeOriginal" IS NOT NULL
        WHERE NOT EXISTS (SELECT 1 FROM _mirror_asset_map m WHERE m.target_asset_id = o.id)
        ORDER BY c.id
        "#,
        source_stem = stem_sql(r#"a."originalFileName""#),
        source_key = capture_key_sql(mode, "a"),
        own_stem = stem_sql(r#"o."originalFileName""#),
        own_key = capture_key_sql(mode, "o"),
    );

    let rows = IdRow::find_by_statement(statement(
        conn,
        &sql,
        [
            ids.into(),
            job.target_user_id.into(),
            job.target_library_id.into(),
        ],
    ))
    .all(conn)
    .await
    .map_err(|e| map_db_err("detecting filename duplicates", e))?;
    Ok(rows.into_iter().map(|row| row.id).collect())
}

/// Permanently skips the given sources as filename duplicates.
pub async fn record_duplicates<C: ConnectionTrait>(
    conn: &C,
    duplicates: &[Uuid],
) -> Result<u64, MirrorError> {
    SkipListRepository::new(conn)
        .record_many(duplicates, SkipReason::DuplicateFilename)
        .await
        .map_err(|e| map_db_err("recording filename duplicates", e))
}
