//! Face and person mirroring.
//!
//! Faces are matched between a source asset and its mirror by bounding-box
//! geometry. Mirrored persons are created at most once per source person and
//! target owner; creation is serialized across processes with a
//! transaction-scoped advisory lock.

use std::path::PathBuf;

use sea_orm::{ConnectionTrait, DatabaseTransaction, FromQueryResult, TransactionTrait};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{plain, statement};
use crate::error::{MirrorError, map_db_err};
use crate::file_mirror::FileMirror;
use crate::models::host::{AdoptionCandidate, FlagRow, MappedAsset, PersonThumbnail, SourceFace};
use crate::repositories::{AssetMapRepository, PersonMapRepository};

/// Same-geometry predicate between a target face `tf` and a source face `sf`.
pub(crate) const SAME_GEOMETRY: &str = r#"
    tf."boundingBoxX1" = sf."boundingBoxX1"
    AND tf."boundingBoxY1" = sf."boundingBoxY1"
    AND tf."boundingBoxX2" = sf."boundingBoxX2"
    AND tf."boundingBoxY2" = sf."boundingBoxY2"
"#;

/// Advisory lock key for creating the mirror of one source person.
pub fn person_lock_key(source_person_id: Uuid) -> i64 {
    let digest = Sha256::digest(source_person_id.as_bytes());
    let mut key = [0u8; 8];
    key.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(key)
}

/// Mirrors every live face of `source_asset` onto `target_asset`.
///
/// Faces whose geometry already exists on the target are left alone, so
/// re-running is a no-op. Links created for person thumbnails are appended
/// to `created`. Returns the number of faces inserted.
pub async fn mirror_faces_for_asset(
    txn: &DatabaseTransaction,
    files: &FileMirror,
    source_asset: Uuid,
    target_asset: Uuid,
    source_owner: Uuid,
    target_owner: Uuid,
    created: &mut Vec<PathBuf>,
) -> Result<usize, MirrorError> {
    let faces = SourceFace::find_by_statement(statement(
        txn,
        r#"
        SELECT id, "personId" AS person_id
        FROM asset_face
        WHERE "assetId" = $1 AND "deletedAt" IS NULL
        ORDER BY id
        "#,
        [source_asset.into()],
    ))
    .all(txn)
    .await
    .map_err(|e| map_db_err("loading source faces", e))?;

    let mut mirrored = 0;
    for face in faces {
        let exists_sql = format!(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM asset_face tf
                JOIN asset_face sf ON sf.id = $2
                WHERE tf."assetId" = $1 AND {SAME_GEOMETRY}
            ) AS flag
            "#
        );
        let exists = FlagRow::find_by_statement(statement(
            txn,
            &exists_sql,
            [target_asset.into(), face.id.into()],
        ))
        .one(txn)
        .await
        .map_err(|e| map_db_err("checking mirrored face geometry", e))?
        .is_some_and(|row| row.flag);
        if exists {
            continue;
        }

        let target_person = match face.person_id {
            Some(person) => {
                get_or_create_mirrored_person(
                    txn,
                    files,
                    person,
                    source_owner,
                    target_owner,
                    created,
                )
                .await?
            }
            None => None,
        };

        let target_face = Uuid::new_v4();
        txn.execute(statement(
            txn,
            r#"
            INSERT INTO asset_face (
                id, "assetId", "personId", "imageWidth", "imageHeight",
                "boundingBoxX1", "boundingBoxY1", "boundingBoxX2", "boundingBoxY2",
                "sourceType", "isVisible"
            )
            SELECT $1, $2, $3, f."imageWidth", f."imageHeight",
                   f."boundingBoxX1", f."boundingBoxY1", f."boundingBoxX2", f."boundingBoxY2",
                   f."sourceType", f."isVisible"
            FROM asset_face f
            WHERE f.id = $4
            "#,
            [
                target_face.into(),
                target_asset.into(),
                target_person.into(),
                face.id.into(),
            ],
        ))
        .await
        .map_err(|e| map_db_err("inserting mirrored face", e))?;

        txn.execute(statement(
            txn,
            r#"
            INSERT INTO face_search ("faceId", embedding)
            SELECT $1, embedding FROM face_search WHERE "faceId" = $2
            ON CONFLICT ("faceId") DO NOTHING
            "#,
            [target_face.into(), face.id.into()],
        ))
        .await
        .map_err(|e| map_db_err("copying face embedding", e))?;

        if let Some(person) = target_person {
            txn.execute(statement(
                txn,
                r#"
                UPDATE person SET "faceAssetId" = $1
                WHERE id = $2
                  AND "ownerId" = $3
                  AND ("faceAssetId" IS NULL
                       OR NOT EXISTS (SELECT 1 FROM asset_face af WHERE af.id = person."faceAssetId"))
                "#,
                [target_face.into(), person.into(), target_owner.into()],
            ))
            .await
            .map_err(|e| map_db_err("promoting representative face", e))?;
        }

        mirrored += 1;
    }

    if mirrored > 0 {
        debug!(
            source_asset_id = %source_asset,
            target_asset_id = %target_asset,
            faces = mirrored,
            "Mirrored faces"
        );
    }
    Ok(mirrored)
}

/// Resolves the mirror of `source_person` for `target_owner`, creating it when absent.
///
/// A mapping whose target person was deleted (typically merged away by the
/// target owner) is repointed to the surviving person its mirrored faces now
/// reference. Returns `None` when the source person no longer exists.
pub async fn get_or_create_mirrored_person(
    txn: &DatabaseTransaction,
    files: &FileMirror,
    source_person: Uuid,
    source_owner: Uuid,
    target_owner: Uuid,
    created: &mut Vec<PathBuf>,
) -> Result<Option<Uuid>, MirrorError> {
    if let Some(person) = resolve_existing(txn, source_person, target_owner).await? {
        return Ok(Some(person));
    }

    txn.execute(statement(
        txn,
        "SELECT pg_advisory_xact_lock($1)",
        [person_lock_key(source_person).into()],
    ))
    .await
    .map_err(|e| map_db_err("acquiring person lock", e))?;

    // Another transaction may have created it while we waited.
    if let Some(person) = resolve_existing(txn, source_person, target_owner).await? {
        return Ok(Some(person));
    }

    let Some(source) = PersonThumbnail::find_by_statement(statement(
        txn,
        r#"
        SELECT id, "ownerId" AS owner_id, COALESCE("thumbnailPath", '') AS thumbnail_path
        FROM person
        WHERE id = $1 AND "ownerId" = $2
        "#,
        [source_person.into(), source_owner.into()],
    ))
    .one(txn)
    .await
    .map_err(|e| map_db_err("loading source person", e))?
    else {
        warn!(source_person_id = %source_person, "Source person not found");
        return Ok(None);
    };

    let target_person = Uuid::new_v4();
    let mut thumbnail = String::new();
    if !source.thumbnail_path.is_empty() {
        match files
            .mirror_person_thumbnail(&source.thumbnail_path, target_owner, target_person)
            .await
        {
            Ok(outcome) => {
                thumbnail = outcome.path().to_string_lossy().into_owned();
                if outcome.created() {
                    created.push(outcome.path().to_path_buf());
                }
            }
            Err(err) => warn!(
                source_person_id = %source_person,
                error = %err,
                "Mirroring person without thumbnail"
            ),
        }
    }

    txn.execute(statement(
        txn,
        r#"
        INSERT INTO person (
            id, "ownerId", name, "thumbnailPath", "isHidden", "birthDate",
            "faceAssetId", "isFavorite", color
        )
        SELECT $1, $2, p.name, $3, p."isHidden", p."birthDate", NULL, false, p.color
        FROM person p
        WHERE p.id = $4
        "#,
        [
            target_person.into(),
            target_owner.into(),
            thumbnail.into(),
            source_person.into(),
        ],
    ))
    .await
    .map_err(|e| map_db_err("inserting mirrored person", e))?;

    PersonMapRepository::new(txn)
        .insert_if_absent(source_person, target_person, source_owner, target_owner)
        .await
        .map_err(|e| map_db_err("recording person mapping", e))?;

    info!(
        source_person_id = %source_person,
        target_person_id = %target_person,
        "Created mirrored person"
    );
    Ok(Some(target_person))
}

/// Returns a valid mapped target person, adopting a merge survivor for a
/// stale mapping and dropping the mapping when there is none.
async fn resolve_existing(
    txn: &DatabaseTransaction,
    source_person: Uuid,
    target_owner: Uuid,
) -> Result<Option<Uuid>, MirrorError> {
    let repo = PersonMapRepository::new(txn);
    let Some(mapping) = repo
        .find(source_person, target_owner)
        .await
        .map_err(|e| map_db_err("loading person mapping", e))?
    else {
        return Ok(None);
    };

    if person_exists(txn, mapping.target_person_id, target_owner).await? {
        return Ok(Some(mapping.target_person_id));
    }

    if let Some(survivor) = find_merge_survivor(txn, source_person, target_owner).await? {
        repo.repoint(mapping.id, survivor)
            .await
            .map_err(|e| map_db_err("repointing person mapping", e))?;
        info!(
            source_person_id = %source_person,
            stale_target_person_id = %mapping.target_person_id,
            target_person_id = %survivor,
            "Adopted merged person"
        );
        return Ok(Some(survivor));
    }

    repo.delete(mapping.id)
        .await
        .map_err(|e| map_db_err("deleting stale person mapping", e))?;
    warn!(
        source_person_id = %source_person,
        stale_target_person_id = %mapping.target_person_id,
        "Dropped stale person mapping"
    );
    Ok(None)
}

async fn person_exists<C: ConnectionTrait>(
    conn: &C,
    person: Uuid,
    owner: Uuid,
) -> Result<bool, MirrorError> {
    let row = FlagRow::find_by_statement(statement(
        conn,
        r#"SELECT EXISTS (SELECT 1 FROM person WHERE id = $1 AND "ownerId" = $2) AS flag"#,
        [person.into(), owner.into()],
    ))
    .one(conn)
    .await
    .map_err(|e| map_db_err("checking mirrored person", e))?;
    Ok(row.is_some_and(|row| row.flag))
}

/// The surviving target person most referenced by mirrors of faces that
/// belong to `source_person` on the source side.
async fn find_merge_survivor(
    txn: &DatabaseTransaction,
    source_person: Uuid,
    target_owner: Uuid,
) -> Result<Option<Uuid>, MirrorError> {
    let sql = format!(
        r#"
        SELECT tf."personId" AS target_person_id, count(*) AS votes
        FROM asset_face sf
        JOIN _mirror_asset_map m
          ON m.source_asset_id = sf."assetId" AND m.target_user_id = $2
        JOIN asset_face tf
          ON tf."assetId" = m.target_asset_id AND tf."deletedAt" IS NULL AND {SAME_GEOMETRY}
        JOIN person tp ON tp.id = tf."personId" AND tp."ownerId" = $2
        WHERE sf."personId" = $1 AND sf."deletedAt" IS NULL
        GROUP BY tf."personId"
        ORDER BY votes DESC, tf."personId"
        LIMIT 1
        "#
    );
    let row = AdoptionCandidate::find_by_statement(statement(
        txn,
        &sql,
        [source_person.into(), target_owner.into()],
    ))
    .one(txn)
    .await
    .map_err(|e| map_db_err("searching merge survivor", e))?;
    Ok(row.map(|row| row.target_person_id))
}

/// Re-mirrors faces on mapped pairs whose source faces changed after the
/// pair's watermark. The watermark only moves when new faces were mirrored.
pub async fn sync_incremental_faces(
    txn: &DatabaseTransaction,
    files: &FileMirror,
    created: &mut Vec<PathBuf>,
) -> Result<usize, MirrorError> {
    let pairs = MappedAsset::find_by_statement(plain(
        txn,
        r#"
        SELECT m.source_asset_id, m.target_asset_id, m.source_user_id, m.target_user_id
        FROM _mirror_asset_map m
        WHERE EXISTS (
            SELECT 1 FROM asset_face af
            WHERE af."assetId" = m.source_asset_id
              AND af."updatedAt" > m.synced_at
              AND af."deletedAt" IS NULL
        )
        ORDER BY m.source_asset_id
        "#,
    ))
    .all(txn)
    .await
    .map_err(|e| map_db_err("loading pairs with changed faces", e))?;

    if !pairs.is_empty() {
        debug!(pairs = pairs.len(), "Re-examining pairs with changed faces");
    }
    let mut total = 0;
    for pair in pairs {
        let savepoint = txn
            .begin()
            .await
            .map_err(|e| map_db_err("opening face savepoint", e))?;
        let mut pair_created = Vec::new();
        let result = mirror_faces_for_asset(
            &savepoint,
            files,
            pair.source_asset_id,
            pair.target_asset_id,
            pair.source_user_id,
            pair.target_user_id,
            &mut pair_created,
        )
        .await;

        match result {
            Ok(count) => {
                // Examined pairs advance even when every face was already present.
                AssetMapRepository::new(&savepoint)
                    .touch_watermark(pair.source_asset_id)
                    .await
                    .map_err(|e| map_db_err("advancing face watermark", e))?;
                savepoint
                    .commit()
                    .await
                    .map_err(|e| map_db_err("releasing face savepoint", e))?;
                created.append(&mut pair_created);
                total += count;
            }
            Err(err) => {
                savepoint
                    .rollback()
                    .await
                    .map_err(|e| map_db_err("rolling back face savepoint", e))?;
                files.unmirror(&pair_created).await;
                warn!(
                    source_asset_id = %pair.source_asset_id,
                    error = %err,
                    "Incremental face sync failed for pair"
                );
            }
        }
    }
    Ok(total)
}
