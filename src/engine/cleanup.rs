//! Cleanup reconciler: tears down mirrors whose source went away and keeps
//! mirrored face-to-person links in step with the source side.

use std::path::PathBuf;

use sea_orm::{ConnectionTrait, DatabaseTransaction, FromQueryResult, TransactionTrait};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::faces::{SAME_GEOMETRY, get_or_create_mirrored_person};
use super::{plain, statement};
use crate::error::{MirrorError, map_db_err};
use crate::file_mirror::FileMirror;
use crate::models::host::{MappedAsset, PathRow, PersonThumbnail};
use crate::repositories::AssetMapRepository;

/// Removes one mirrored asset: files first, then album links, the asset row
/// (children go by cascade) and the mapping.
///
/// Returns false, leaving every row intact, when any file could not be
/// removed; the next cycle retries.
pub async fn teardown_mirrored_asset<C: ConnectionTrait>(
    conn: &C,
    files: &FileMirror,
    target_asset_id: Uuid,
    target_owner: Uuid,
) -> Result<bool, MirrorError> {
    let paths: Vec<String> = PathRow::find_by_statement(statement(
        conn,
        r#"SELECT path FROM asset_file WHERE "assetId" = $1"#,
        [target_asset_id.into()],
    ))
    .all(conn)
    .await
    .map_err(|e| map_db_err("loading mirrored files", e))?
    .into_iter()
    .map(|row| row.path)
    .collect();

    let report = files.unmirror(&paths).await;
    if !report.is_clean() {
        warn!(
            target_asset_id = %target_asset_id,
            failed = report.failed.len(),
            "Keeping mirrored asset rows until its files can be removed"
        );
        return Ok(false);
    }

    conn.execute(statement(
        conn,
        r#"DELETE FROM album_asset WHERE "assetId" = $1"#,
        [target_asset_id.into()],
    ))
    .await
    .map_err(|e| map_db_err("detaching mirrored asset from albums", e))?;

    conn.execute(statement(
        conn,
        r#"DELETE FROM asset WHERE id = $1 AND "ownerId" = $2"#,
        [target_asset_id.into(), target_owner.into()],
    ))
    .await
    .map_err(|e| map_db_err("deleting mirrored asset", e))?;

    AssetMapRepository::new(conn)
        .delete_by_target(target_asset_id)
        .await
        .map_err(|e| map_db_err("deleting asset mapping", e))?;
    Ok(true)
}

/// Tears down mirrors whose source asset was hard- or soft-deleted.
/// Each asset is isolated in its own savepoint.
pub async fn cleanup_deleted_assets(
    txn: &DatabaseTransaction,
    files: &FileMirror,
) -> Result<u64, MirrorError> {
    let orphaned = MappedAsset::find_by_statement(plain(
        txn,
        r#"
        SELECT m.source_asset_id, m.target_asset_id, m.source_user_id, m.target_user_id
        FROM _mirror_asset_map m
        LEFT JOIN asset a ON a.id = m.source_asset_id AND a."deletedAt" IS NULL
        WHERE a.id IS NULL
        ORDER BY m.source_asset_id
        "#,
    ))
    .all(txn)
    .await
    .map_err(|e| map_db_err("loading mappings with deleted sources", e))?;

    let mut cleaned = 0;
    for row in orphaned {
        let savepoint = txn
            .begin()
            .await
            .map_err(|e| map_db_err("opening cleanup savepoint", e))?;
        match teardown_mirrored_asset(&savepoint, files, row.target_asset_id, row.target_user_id)
            .await
        {
            Ok(true) => {
                savepoint
                    .commit()
                    .await
                    .map_err(|e| map_db_err("releasing cleanup savepoint", e))?;
                info!(
                    source_asset_id = %row.source_asset_id,
                    target_asset_id = %row.target_asset_id,
                    "Removed mirror of deleted asset"
                );
                cleaned += 1;
            }
            Ok(false) => {
                savepoint
                    .rollback()
                    .await
                    .map_err(|e| map_db_err("rolling back cleanup savepoint", e))?;
            }
            Err(err) => {
                savepoint
                    .rollback()
                    .await
                    .map_err(|e| map_db_err("rolling back cleanup savepoint", e))?;
                error!(
                    target_asset_id = %row.target_asset_id,
                    error = %err,
                    "Failed to remove mirror of deleted asset"
                );
            }
        }
    }
    Ok(cleaned)
}

#[derive(Debug, FromQueryResult)]
struct ReassignedFace {
    target_face_id: Uuid,
    new_source_person_id: Option<Uuid>,
    source_user_id: Uuid,
    target_user_id: Uuid,
}

/// Relinks mirrored faces whose source face now points at a different person.
/// Counts only faces whose reference actually changed.
pub async fn cleanup_reassigned_faces(
    txn: &DatabaseTransaction,
    files: &FileMirror,
    created: &mut Vec<PathBuf>,
) -> Result<u64, MirrorError> {
    let sql = format!(
        r#"
        SELECT tf.id AS target_face_id,
               sf."personId" AS new_source_person_id,
               m.source_user_id,
               m.target_user_id
        FROM _mirror_asset_map m
        JOIN asset_face sf ON sf."assetId" = m.source_asset_id AND sf."deletedAt" IS NULL
        JOIN asset_face tf ON tf."assetId" = m.target_asset_id AND tf."deletedAt" IS NULL
             AND {SAME_GEOMETRY}
        LEFT JOIN _mirror_person_map pm
             ON pm.source_person_id = sf."personId" AND pm.target_user_id = m.target_user_id
        WHERE tf."personId" IS DISTINCT FROM pm.target_person_id
        ORDER BY tf.id
        "#
    );
    let mismatched = ReassignedFace::find_by_statement(plain(txn, &sql))
        .all(txn)
        .await
        .map_err(|e| map_db_err("loading reassigned faces", e))?;

    let mut changed = 0;
    for face in mismatched {
        let savepoint = txn
            .begin()
            .await
            .map_err(|e| map_db_err("opening face savepoint", e))?;
        let mut face_created = Vec::new();
        let result = relink_face(&savepoint, files, &face, &mut face_created).await;
        match result {
            Ok(rows) => {
                savepoint
                    .commit()
                    .await
                    .map_err(|e| map_db_err("releasing face savepoint", e))?;
                created.append(&mut face_created);
                changed += rows;
            }
            Err(err) => {
                savepoint
                    .rollback()
                    .await
                    .map_err(|e| map_db_err("rolling back face savepoint", e))?;
                files.unmirror(&face_created).await;
                warn!(
                    target_face_id = %face.target_face_id,
                    error = %err,
                    "Failed to relink reassigned face"
                );
            }
        }
    }

    if changed > 0 {
        info!(count = changed, "Relinked faces after person reassignment");
    }
    Ok(changed)
}

async fn relink_face(
    sp: &DatabaseTransaction,
    files: &FileMirror,
    face: &ReassignedFace,
    created: &mut Vec<PathBuf>,
) -> Result<u64, MirrorError> {
    let target_person = match face.new_source_person_id {
        Some(person) => {
            get_or_create_mirrored_person(
                sp,
                files,
                person,
                face.source_user_id,
                face.target_user_id,
                created,
            )
            .await?
        }
        None => None,
    };

    let result = sp
        .execute(statement(
            sp,
            r#"
            UPDATE asset_face SET "personId" = $1
            WHERE id = $2 AND "personId" IS DISTINCT FROM $1
            "#,
            [target_person.into(), face.target_face_id.into()],
        ))
        .await
        .map_err(|e| map_db_err("relinking mirrored face", e))?;
    Ok(result.rows_affected())
}

/// Deletes mirrored persons whose source person is gone, then drops every
/// mapping whose source person is gone. Returns the deleted persons so the
/// caller can remove their thumbnails once the transaction commits.
pub async fn cleanup_orphaned_persons<C: ConnectionTrait>(
    conn: &C,
) -> Result<Vec<PersonThumbnail>, MirrorError> {
    let deleted = PersonThumbnail::find_by_statement(plain(
        conn,
        r#"
        DELETE FROM person t
        USING _mirror_person_map m
        WHERE t.id = m.target_person_id
          AND t."ownerId" = m.target_user_id
          AND NOT EXISTS (SELECT 1 FROM person s WHERE s.id = m.source_person_id)
        RETURNING t.id, t."ownerId" AS owner_id, COALESCE(t."thumbnailPath", '') AS thumbnail_path
        "#,
    ))
    .all(conn)
    .await
    .map_err(|e| map_db_err("deleting orphaned persons", e))?;

    conn.execute(plain(
        conn,
        r#"
        DELETE FROM _mirror_person_map m
        WHERE NOT EXISTS (SELECT 1 FROM person s WHERE s.id = m.source_person_id)
        "#,
    ))
    .await
    .map_err(|e| map_db_err("deleting orphaned person mappings", e))?;

    if !deleted.is_empty() {
        info!(count = deleted.len(), "Removed mirrored persons whose source is gone");
    }
    Ok(deleted)
}
