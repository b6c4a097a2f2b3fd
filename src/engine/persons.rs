//! One-way person metadata sync: names, visibility and face-crop thumbnails.
//!
//! Every update is scoped to mapped target persons still owned by the
//! mapping's target user, and is a no-op when the values already match.

use std::path::PathBuf;

use sea_orm::{ConnectionTrait, DatabaseTransaction, FromQueryResult};
use tracing::{debug, info, warn};

use super::{plain, statement};
use crate::error::{MirrorError, map_db_err};
use crate::file_mirror::FileMirror;
use crate::models::host::{IdRow, PersonThumbnail};

pub async fn sync_names<C: ConnectionTrait>(conn: &C) -> Result<u64, MirrorError> {
    let updated = IdRow::find_by_statement(plain(
        conn,
        r#"
        UPDATE person t
        SET name = s.name
        FROM _mirror_person_map m
        JOIN person s ON s.id = m.source_person_id
        WHERE t.id = m.target_person_id
          AND t."ownerId" = m.target_user_id
          AND t.name IS DISTINCT FROM s.name
        RETURNING t.id
        "#,
    ))
    .all(conn)
    .await
    .map_err(|e| map_db_err("syncing person names", e))?;

    for row in &updated {
        debug!(target_person_id = %row.id, "Updated mirrored person name");
    }
    Ok(updated.len() as u64)
}

pub async fn sync_visibility<C: ConnectionTrait>(conn: &C) -> Result<u64, MirrorError> {
    let updated = IdRow::find_by_statement(plain(
        conn,
        r#"
        UPDATE person t
        SET "isHidden" = s."isHidden"
        FROM _mirror_person_map m
        JOIN person s ON s.id = m.source_person_id
        WHERE t.id = m.target_person_id
          AND t."ownerId" = m.target_user_id
          AND t."isHidden" IS DISTINCT FROM s."isHidden"
        RETURNING t.id
        "#,
    ))
    .all(conn)
    .await
    .map_err(|e| map_db_err("syncing person visibility", e))?;
    Ok(updated.len() as u64)
}

/// Fills in thumbnails for mirrored persons created before the source had one.
pub async fn sync_thumbnails(
    txn: &DatabaseTransaction,
    files: &FileMirror,
    created: &mut Vec<PathBuf>,
) -> Result<u64, MirrorError> {
    // `id` and `owner_id` are the target person's; the path is the source crop.
    let pending = PersonThumbnail::find_by_statement(plain(
        txn,
        r#"
        SELECT m.target_person_id AS id,
               m.target_user_id AS owner_id,
               s."thumbnailPath" AS thumbnail_path
        FROM _mirror_person_map m
        JOIN person s ON s.id = m.source_person_id
        JOIN person t ON t.id = m.target_person_id AND t."ownerId" = m.target_user_id
        WHERE s."thumbnailPath" IS NOT NULL
          AND s."thumbnailPath" <> ''
          AND (t."thumbnailPath" IS NULL OR t."thumbnailPath" = '')
        "#,
    ))
    .all(txn)
    .await
    .map_err(|e| map_db_err("loading persons missing thumbnails", e))?;

    let mut updated = 0;
    for person in pending {
        let outcome = match files
            .mirror_person_thumbnail(&person.thumbnail_path, person.owner_id, person.id)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(target_person_id = %person.id, error = %err, "Could not mirror person thumbnail");
                continue;
            }
        };
        if outcome.created() {
            created.push(outcome.path().to_path_buf());
        }

        txn.execute(statement(
            txn,
            r#"UPDATE person SET "thumbnailPath" = $1 WHERE id = $2 AND "ownerId" = $3"#,
            [
                outcome.path().to_string_lossy().into_owned().into(),
                person.id.into(),
                person.owner_id.into(),
            ],
        ))
        .await
        .map_err(|e| map_db_err("updating person thumbnail", e))?;
        info!(target_person_id = %person.id, "Updated mirrored person thumbnail");
        updated += 1;
    }
    Ok(updated)
}
