//! Operator maintenance: status, reset of a target user's mirrors, skip-list
//! clearing and removal of mirrors that duplicate the target's own uploads.
//!
//! Every mutation here reuses the cleanup teardown primitive, so files are
//! removed before rows and a failed removal leaves the rows for a retry.

use std::collections::HashMap;

use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, FromQueryResult, TransactionTrait,
};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::cleanup::teardown_mirrored_asset;
use super::duplicates::{capture_key_sql, stem_sql};
use super::{plain, statement};
use crate::config::DuplicateMatch;
use crate::error::{MirrorError, map_db_err};
use crate::file_mirror::FileMirror;
use crate::models::SkipReason;
use crate::models::host::{MappedAsset, PersonThumbnail};
use crate::repositories::skip_list::ReasonCount;
use crate::repositories::{
    AssetMapRepository, FailureRepository, PersonMapRepository, SkipListRepository,
};

/// Assets torn down per transaction.
const TEARDOWN_CHUNK: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromQueryResult)]
pub struct TargetUserSummary {
    pub target_user_id: Uuid,
    pub email: String,
    pub assets: i64,
    pub persons: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorStatus {
    pub mapped_assets: u64,
    pub mapped_persons: u64,
    pub failing_records: u64,
    pub skipped: Vec<(String, i64)>,
    pub targets: Vec<TargetUserSummary>,
}

pub async fn status(db: &DatabaseConnection) -> Result<MirrorStatus, MirrorError> {
    let mapped_assets = AssetMapRepository::new(db)
        .count()
        .await
        .map_err(|e| map_db_err("counting asset mappings", e))?;
    let mapped_persons = PersonMapRepository::new(db)
        .count()
        .await
        .map_err(|e| map_db_err("counting person mappings", e))?;
    let failing_records = FailureRepository::new(db)
        .count()
        .await
        .map_err(|e| map_db_err("counting record failures", e))?;
    let skipped = SkipListRepository::new(db)
        .count_by_reason()
        .await
        .map_err(|e| map_db_err("counting skipped sources", e))?
        .into_iter()
        .map(|ReasonCount { reason, count }| (reason, count))
        .collect();

    let targets = TargetUserSummary::find_by_statement(plain(
        db,
        r#"
        SELECT t.target_user_id,
               COALESCE(u.email, '') AS email,
               (SELECT COUNT(*) FROM _mirror_asset_map m
                 WHERE m.target_user_id = t.target_user_id) AS assets,
               (SELECT COUNT(*) FROM _mirror_person_map p
                 WHERE p.target_user_id = t.target_user_id) AS persons
        FROM (
            SELECT target_user_id FROM _mirror_asset_map
            UNION
            SELECT target_user_id FROM _mirror_person_map
        ) t
        LEFT JOIN "user" u ON u.id = t.target_user_id
        ORDER BY email, t.target_user_id
        "#,
    ))
    .all(db)
    .await
    .map_err(|e| map_db_err("summarizing target users", e))?;

    Ok(MirrorStatus {
        mapped_assets,
        mapped_persons,
        failing_records,
        skipped,
        targets,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub struct PersonMapping {
    pub source_person_id: Uuid,
    pub target_person_id: Uuid,
}

/// Everything the engine created for one target user.
#[derive(Debug, Clone, Default)]
pub struct SyncedInventory {
    pub assets: Vec<MappedAsset>,
    pub persons: Vec<PersonMapping>,
}

impl SyncedInventory {
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty() && self.persons.is_empty()
    }
}

pub async fn preview_synced(
    db: &DatabaseConnection,
    target_user_id: Uuid,
) -> Result<SyncedInventory, MirrorError> {
    let assets = MappedAsset::find_by_statement(statement(
        db,
        r#"
        SELECT source_asset_id, target_asset_id, source_user_id, target_user_id
        FROM _mirror_asset_map
        WHERE target_user_id = $1
        ORDER BY source_asset_id
        "#,
        [target_user_id.into()],
    ))
    .all(db)
    .await
    .map_err(|e| map_db_err("listing synced assets", e))?;

    let persons = PersonMapping::find_by_statement(statement(
        db,
        r#"
        SELECT source_person_id, target_person_id
        FROM _mirror_person_map
        WHERE target_user_id = $1
        ORDER BY source_person_id
        "#,
        [target_user_id.into()],
    ))
    .all(db)
    .await
    .map_err(|e| map_db_err("listing mirrored persons", e))?;

    Ok(SyncedInventory { assets, persons })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub assets_deleted: u64,
    pub assets_failed: u64,
    pub persons_deleted: u64,
}

/// Removes every mirrored asset and person for `target_user_id`.
///
/// Sources are not skipped, so the next cycle mirrors them again.
pub async fn delete_synced(
    db: &DatabaseConnection,
    files: &FileMirror,
    target_user_id: Uuid,
) -> Result<DeleteReport, MirrorError> {
    let inventory = preview_synced(db, target_user_id).await?;
    let targets: Vec<Uuid> = inventory.assets.iter().map(|a| a.target_asset_id).collect();

    let mut report = teardown_in_chunks(db, files, target_user_id, &targets, None).await?;

    let txn = begin(db).await?;
    let deleted = PersonThumbnail::find_by_statement(statement(
        &txn,
        r#"
        DELETE FROM person t
        USING _mirror_person_map m
        WHERE t.id = m.target_person_id
          AND m.target_user_id = $1
          AND t."ownerId" = $1
        RETURNING t.id, t."ownerId" AS owner_id, COALESCE(t."thumbnailPath", '') AS thumbnail_path
        "#,
        [target_user_id.into()],
    ))
    .all(&txn)
    .await
    .map_err(|e| map_db_err("deleting mirrored persons", e))?;
    txn.execute(statement(
        &txn,
        "DELETE FROM _mirror_person_map WHERE target_user_id = $1",
        [target_user_id.into()],
    ))
    .await
    .map_err(|e| map_db_err("deleting person mappings", e))?;
    commit(txn).await?;

    let thumbnails: Vec<&str> = deleted
        .iter()
        .map(|p| p.thumbnail_path.as_str())
        .filter(|path| !path.is_empty())
        .collect();
    let unlinked = files.unmirror(&thumbnails).await;
    if !unlinked.is_clean() {
        warn!(failed = unlinked.failed.len(), "Some person thumbnails could not be removed");
    }

    report.persons_deleted = deleted.len() as u64;
    info!(
        target_user_id = %target_user_id,
        assets_deleted = report.assets_deleted,
        assets_failed = report.assets_failed,
        persons_deleted = report.persons_deleted,
        "Deleted synced data"
    );
    Ok(report)
}

/// Clears skip entries, all of them or those with `reason`.
pub async fn clear_skipped(db: &DatabaseConnection, reason: Option<&str>) -> Result<u64, MirrorError> {
    let cleared = SkipListRepository::new(db)
        .clear(reason)
        .await
        .map_err(|e| map_db_err("clearing skipped sources", e))?;
    info!(cleared, reason = reason.unwrap_or("all"), "Cleared skipped sources");
    Ok(cleared)
}

/// A mirror that collides with an upload the target made themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromQueryResult)]
pub struct SyncedDuplicate {
    pub source_asset_id: Uuid,
    pub target_asset_id: Uuid,
    pub synced_file_name: String,
    pub synced_path: String,
    pub original_asset_id: Uuid,
    pub original_path: String,
}

/// Finds existing mirrors for `target_user_id` that the duplicate detector
/// would have skipped had the target's upload existed first.
pub async fn find_synced_duplicates(
    db: &DatabaseConnection,
    target_user_id: Uuid,
    mode: DuplicateMatch,
) -> Result<Vec<SyncedDuplicate>, MirrorError> {
    let sql = format!(
        r#"
        SELECT DISTINCT ON (m.target_asset_id)
               m.source_asset_id,
               m.target_asset_id,
               ta."originalFileName" AS synced_file_name,
               ta."originalPath" AS synced_path,
               oa.id AS original_asset_id,
               oa."originalPath" AS original_path
        FROM _mirror_asset_map m
        JOIN asset ta ON ta.id = m.target_asset_id AND ta."deletedAt" IS NULL
        JOIN asset_exif te ON te."assetId" = ta.id AND te."dateTimeOriginal" IS NOT NULL
        JOIN asset oa
          ON oa."ownerId" = m.target_user_id
         AND oa.id <> ta.id
         AND oa."libraryId" IS DISTINCT FROM ta."libraryId"
         AND oa."deletedAt" IS NULL
         AND {own_stem} = {synced_stem}
         AND {own_key} = {synced_key}
        JOIN asset_exif oe ON oe."assetId" = oa.id AND oe."dateTimeOriginal" IS NOT NULL
        WHERE m.target_user_id = $1
          AND NOT EXISTS (SELECT 1 FROM _mirror_asset_map x WHERE x.target_asset_id = oa.id)
        ORDER BY m.target_asset_id, oa.id
        "#,
        own_stem = stem_sql(r#"oa."originalFileName""#),
        synced_stem = stem_sql(r#"ta."originalFileName""#),
        own_key = capture_key_sql(mode, "oa"),
        synced_key = capture_key_sql(mode, "ta"),
    );

    SyncedDuplicate::find_by_statement(statement(db, &sql, [target_user_id.into()]))
        .all(db)
        .await
        .map_err(|e| map_db_err("finding synced duplicates", e))
}

/// Tears down the given duplicate mirrors and skips their sources for good.
pub async fn dedup_synced(
    db: &DatabaseConnection,
    files: &FileMirror,
    target_user_id: Uuid,
    duplicates: &[SyncedDuplicate],
) -> Result<DeleteReport, MirrorError> {
    let targets: Vec<Uuid> = duplicates.iter().map(|d| d.target_asset_id).collect();
    let sources: HashMap<Uuid, Uuid> = duplicates
        .iter()
        .map(|d| (d.target_asset_id, d.source_asset_id))
        .collect();
    let report = teardown_in_chunks(db, files, target_user_id, &targets, Some(&sources)).await?;

    info!(
        target_user_id = %target_user_id,
        deleted = report.assets_deleted,
        failed = report.assets_failed,
        "Removed synced duplicates"
    );
    Ok(report)
}

/// Tears down `targets` in chunked transactions with a savepoint per asset.
/// When `skip_sources` maps a target to its source, that source is skipped
/// as a filename duplicate in the same savepoint.
async fn teardown_in_chunks(
    db: &DatabaseConnection,
    files: &FileMirror,
    target_user_id: Uuid,
    targets: &[Uuid],
    skip_sources: Option<&HashMap<Uuid, Uuid>>,
) -> Result<DeleteReport, MirrorError> {
    let mut report = DeleteReport::default();
    for chunk in targets.chunks(TEARDOWN_CHUNK) {
        let txn = begin(db).await?;
        for &target_asset_id in chunk {
            let savepoint = txn
                .begin()
                .await
                .map_err(|e| map_db_err("opening teardown savepoint", e))?;
            let source = skip_sources.and_then(|map| map.get(&target_asset_id).copied());
            let removed = teardown_and_skip(&savepoint, files, target_asset_id, target_user_id, source).await;
            match removed {
                Ok(true) => {
                    savepoint
                        .commit()
                        .await
                        .map_err(|e| map_db_err("releasing teardown savepoint", e))?;
                    report.assets_deleted += 1;
                }
                Ok(false) => {
                    savepoint
                        .rollback()
                        .await
                        .map_err(|e| map_db_err("rolling back teardown savepoint", e))?;
                    report.assets_failed += 1;
                }
                Err(err) => {
                    savepoint
                        .rollback()
                        .await
                        .map_err(|e| map_db_err("rolling back teardown savepoint", e))?;
                    warn!(target_asset_id = %target_asset_id, error = %err, "Teardown failed");
                    report.assets_failed += 1;
                }
            }
        }
        commit(txn).await?;
        info!(
            done = report.assets_deleted + report.assets_failed,
            total = targets.len(),
            "Teardown progress"
        );
    }
    Ok(report)
}

async fn teardown_and_skip(
    sp: &DatabaseTransaction,
    files: &FileMirror,
    target_asset_id: Uuid,
    target_user_id: Uuid,
    skip_source: Option<Uuid>,
) -> Result<bool, MirrorError> {
    let removed = teardown_mirrored_asset(sp, files, target_asset_id, target_user_id).await?;
    if removed && let Some(source) = skip_source {
        SkipListRepository::new(sp)
            .record(source, SkipReason::DuplicateFilename)
            .await
            .map_err(|e| map_db_err("skipping duplicate source", e))?;
    }
    Ok(removed)
}

async fn begin(db: &DatabaseConnection) -> Result<DatabaseTransaction, MirrorError> {
    db.begin()
        .await
        .map_err(|e| map_db_err("beginning maintenance transaction", e))
}

async fn commit(txn: DatabaseTransaction) -> Result<(), MirrorError> {
    txn.commit()
        .await
        .map_err(|e| map_db_err("committing maintenance transaction", e))
}
