//! Album assignment for jobs that name a destination album.
//!
//! Inserts only into albums that exist, are not deleted and belong to the
//! job's target owner.

use sea_orm::{ConnectionTrait, FromQueryResult};
use tracing::info;
use uuid::Uuid;

use super::statement;
use crate::config::SyncJob;
use crate::error::{MirrorError, map_db_err};
use crate::models::host::IdRow;

/// Adds specific mirrored assets to the job's album.
pub async fn add_assets_to_album<C: ConnectionTrait>(
    conn: &C,
    job: &SyncJob,
    asset_ids: &[Uuid],
) -> Result<u64, MirrorError> {
    let Some(album_id) = job.album_id else {
        return Ok(0);
    };
    if asset_ids.is_empty() {
        return Ok(0);
    }

    let added = IdRow::find_by_statement(statement(
        conn,
        r#"
        INSERT INTO album_asset ("albumId", "assetId")
        SELECT $1, x.id
        FROM unnest($2::uuid[]) AS x(id)
        WHERE EXISTS (
            SELECT 1 FROM album al
            WHERE al.id = $1 AND al."ownerId" = $3 AND al."deletedAt" IS NULL
        )
        ON CONFLICT DO NOTHING
        RETURNING "assetId" AS id
        "#,
        [
            album_id.into(),
            asset_ids.to_vec().into(),
            job.target_user_id.into(),
        ],
    ))
    .all(conn)
    .await
    .map_err(|e| map_db_err("adding assets to album", e))?;

    let count = added.len() as u64;
    if count > 0 {
        touch_album(conn, album_id, job.target_user_id).await?;
        info!(job = %job.name, album_id = %album_id, count, "Added mirrored assets to album");
    }
    Ok(count)
}

/// Adds every live mirror of this job that is missing from the album.
pub async fn backfill_album<C: ConnectionTrait>(
    conn: &C,
    job: &SyncJob,
) -> Result<u64, MirrorError> {
    let Some(album_id) = job.album_id else {
        return Ok(0);
    };

    let added = IdRow::find_by_statement(statement(
        conn,
        r#"
        INSERT INTO album_asset ("albumId", "assetId")
        SELECT $1, m.target_asset_id
        FROM _mirror_asset_map m
        JOIN asset ta ON ta.id = m.target_asset_id
        JOIN album al ON al.id = $1 AND al."ownerId" = $3 AND al."deletedAt" IS NULL
        WHERE m.source_user_id = $2
          AND m.target_user_id = $3
          AND ta."libraryId" = $4
          AND ta."deletedAt" IS NULL
          AND NOT EXISTS (
            SELECT 1 FROM album_asset aa
            WHERE aa."albumId" = $1 AND aa."assetId" = m.target_asset_id
          )
        ON CONFLICT DO NOTHING
        RETURNING "assetId" AS id
        "#,
        [
            album_id.into(),
            job.source_user_id.into(),
            job.target_user_id.into(),
            job.target_library_id.into(),
        ],
    ))
    .all(conn)
    .await
    .map_err(|e| map_db_err("backfilling album", e))?;

    let count = added.len() as u64;
    if count > 0 {
        touch_album(conn, album_id, job.target_user_id).await?;
        info!(job = %job.name, album_id = %album_id, count, "Backfilled album");
    }
    Ok(count)
}

async fn touch_album<C: ConnectionTrait>(
    conn: &C,
    album_id: Uuid,
    owner: Uuid,
) -> Result<(), MirrorError> {
    conn.execute(statement(
        conn,
        r#"UPDATE album SET "updatedAt" = now() WHERE id = $1 AND "ownerId" = $2"#,
        [album_id.into(), owner.into()],
    ))
    .await
    .map_err(|e| map_db_err("bumping album timestamp", e))?;
    Ok(())
}
