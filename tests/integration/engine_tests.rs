//! End-to-end sync cycles against the host fixture.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use immich_mirror::engine::MirrorEngine;
use immich_mirror::engine::faces::get_or_create_mirrored_person;
use immich_mirror::file_mirror::FileMirror;
use sea_orm::{ConnectionTrait, FromQueryResult, Statement, TransactionTrait};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::test_utils::{
    World, count, exec, insert_asset, insert_face, insert_person, insert_source_asset, mirror_of,
    seed_world, setup_host_db,
};

#[derive(Debug, FromQueryResult)]
struct TargetAsset {
    owner_id: Uuid,
    library_id: Option<Uuid>,
    original_path: String,
    is_favorite: bool,
    is_external: bool,
}

async fn target_asset(db: &sea_orm::DatabaseConnection, id: Uuid) -> Result<TargetAsset> {
    TargetAsset::find_by_statement(Statement::from_sql_and_values(
        db.get_database_backend(),
        r#"
        SELECT "ownerId" AS owner_id, "libraryId" AS library_id,
               "originalPath" AS original_path, "isFavorite" AS is_favorite,
               "isExternal" AS is_external
        FROM asset WHERE id = $1
        "#,
        [id.into()],
    ))
    .one(db)
    .await?
    .context("target asset missing")
}

#[derive(Debug, FromQueryResult)]
struct PathRow {
    path: String,
}

async fn file_paths(db: &sea_orm::DatabaseConnection, asset: Uuid) -> Result<Vec<PathBuf>> {
    let rows = PathRow::find_by_statement(Statement::from_sql_and_values(
        db.get_database_backend(),
        r#"SELECT path FROM asset_file WHERE "assetId" = $1"#,
        [asset.into()],
    ))
    .all(db)
    .await?;
    Ok(rows.into_iter().map(|row| PathBuf::from(row.path)).collect())
}

#[derive(Debug, FromQueryResult)]
struct PersonRow {
    id: Uuid,
    name: String,
    thumbnail_path: String,
}

async fn target_persons(db: &sea_orm::DatabaseConnection, world: &World) -> Result<Vec<PersonRow>> {
    Ok(PersonRow::find_by_statement(Statement::from_sql_and_values(
        db.get_database_backend(),
        r#"SELECT id, name, "thumbnailPath" AS thumbnail_path FROM person WHERE "ownerId" = $1 ORDER BY name"#,
        [world.target_user.into()],
    ))
    .all(db)
    .await?)
}

#[derive(Debug, FromQueryResult)]
struct FacePerson {
    person_id: Option<Uuid>,
}

async fn face_people(db: &sea_orm::DatabaseConnection, asset: Uuid) -> Result<Vec<Option<Uuid>>> {
    let rows = FacePerson::find_by_statement(Statement::from_sql_and_values(
        db.get_database_backend(),
        r#"SELECT "personId" AS person_id FROM asset_face WHERE "assetId" = $1 ORDER BY "boundingBoxX1""#,
        [asset.into()],
    ))
    .all(db)
    .await?;
    Ok(rows.into_iter().map(|row| row.person_id).collect())
}

#[tokio::test]
async fn full_cycle_mirrors_assets_faces_and_album_then_goes_quiet() -> Result<()> {
    let Some(test_db) = setup_host_db().await else {
        return Ok(());
    };
    let db = &test_db.db;
    let world = seed_world(db).await?;

    let carol = insert_person(db, &world, world.source_user, "Carol", true).await?;
    let first = insert_source_asset(db, &world, "IMG_0001.jpg", b"c1", "2024-05-01T10:00:00Z").await?;
    insert_face(db, first, Some(carol), 10).await?;
    insert_source_asset(db, &world, "IMG_0002.jpg", b"c2", "2024-05-02T10:00:00Z").await?;
    insert_source_asset(db, &world, "IMG_0003.jpg", b"c3", "2024-05-03T10:00:00Z").await?;

    let engine = MirrorEngine::new(db.clone(), world.config(true));
    let token = CancellationToken::new();

    let summary = engine.run_cycle(&token).await?;
    assert_eq!(summary.assets_synced, 3);
    assert_eq!(summary.faces_synced, 1);
    assert_eq!(summary.album_assets_added, 3);

    let mirror = mirror_of(db, first).await?.context("first asset not mirrored")?;
    let row = target_asset(db, mirror).await?;
    assert_eq!(row.owner_id, world.target_user);
    assert_eq!(row.library_id, Some(world.target_library));
    assert_eq!(row.original_path, format!("{}IMG_0001.jpg", world.target_prefix()));
    assert!(!row.is_favorite, "favorite flag is personal and must not be copied");
    assert!(row.is_external);

    let paths = file_paths(db, mirror).await?;
    assert_eq!(paths.len(), 1);
    assert!(paths[0].starts_with(world.upload_root().join("thumbs").join(world.target_user.to_string())));
    assert!(paths[0].exists(), "derived file should be hardlinked");

    let persons = target_persons(db, &world).await?;
    assert_eq!(persons.len(), 1);
    assert_eq!(persons[0].name, "Carol");
    assert!(PathBuf::from(&persons[0].thumbnail_path).exists());
    assert_eq!(face_people(db, mirror).await?, vec![Some(persons[0].id)]);

    let exif_rows = count(
        db,
        r#"SELECT COUNT(*) AS count FROM asset_exif e JOIN asset a ON a.id = e."assetId" WHERE a."ownerId" = $1 AND e.city = 'Lisbon'"#,
        vec![world.target_user.into()],
    )
    .await?;
    assert_eq!(exif_rows, 3);

    let again = engine.run_cycle(&token).await?;
    assert!(again.is_empty(), "second cycle should change nothing: {again:?}");
    Ok(())
}

#[tokio::test]
async fn empty_target_prefix_keeps_the_source_path() -> Result<()> {
    let Some(test_db) = setup_host_db().await else {
        return Ok(());
    };
    let db = &test_db.db;
    let world = seed_world(db).await?;
    let source = insert_source_asset(db, &world, "IMG_0050.jpg", b"e1", "2024-05-10T10:00:00Z").await?;

    let mut config = (*world.config(false)).clone();
    config.jobs[0].target_path_prefix = String::new();
    let engine = MirrorEngine::new(db.clone(), Arc::new(config));
    let summary = engine.run_cycle(&CancellationToken::new()).await?;
    assert_eq!(summary.assets_synced, 1);

    let mirror = mirror_of(db, source).await?.context("not mirrored")?;
    let row = target_asset(db, mirror).await?;
    assert_eq!(row.owner_id, world.target_user);
    assert_eq!(row.library_id, Some(world.target_library));
    assert_eq!(row.original_path, format!("{}IMG_0050.jpg", world.source_prefix()));
    Ok(())
}

#[tokio::test]
async fn lost_mapping_is_recovered_without_duplicating_the_mirror() -> Result<()> {
    let Some(test_db) = setup_host_db().await else {
        return Ok(());
    };
    let db = &test_db.db;
    let world = seed_world(db).await?;
    let source = insert_source_asset(db, &world, "IMG_0100.jpg", b"r1", "2024-06-01T08:00:00Z").await?;

    let engine = MirrorEngine::new(db.clone(), world.config(false));
    let token = CancellationToken::new();
    engine.run_cycle(&token).await?;
    let mirror = mirror_of(db, source).await?.context("not mirrored")?;

    exec(db, "DELETE FROM _mirror_asset_map", vec![]).await?;

    let summary = engine.run_cycle(&token).await?;
    assert_eq!(summary.assets_synced, 0);
    assert_eq!(summary.assets_recovered, 1);
    assert_eq!(mirror_of(db, source).await?, Some(mirror));

    let mirrors = count(
        db,
        r#"SELECT COUNT(*) AS count FROM asset WHERE "ownerId" = $1"#,
        vec![world.target_user.into()],
    )
    .await?;
    assert_eq!(mirrors, 1);
    Ok(())
}

#[tokio::test]
async fn each_source_and_target_is_mapped_at_most_once() -> Result<()> {
    let Some(test_db) = setup_host_db().await else {
        return Ok(());
    };
    let db = &test_db.db;
    let world = seed_world(db).await?;
    let first = insert_source_asset(db, &world, "IMG_0150.jpg", b"u1", "2024-06-05T08:00:00Z").await?;
    let second = insert_source_asset(db, &world, "IMG_0151.jpg", b"u2", "2024-06-06T08:00:00Z").await?;

    let engine = MirrorEngine::new(db.clone(), world.config(false));
    let token = CancellationToken::new();
    engine.run_cycle(&token).await?;
    let first_mirror = mirror_of(db, first).await?.context("first not mirrored")?;

    let insert_mapping = r#"
        INSERT INTO _mirror_asset_map (id, source_asset_id, target_asset_id, source_user_id, target_user_id)
        VALUES ($1, $2, $3, $4, $5)
    "#;
    let same_source = exec(
        db,
        insert_mapping,
        vec![
            Uuid::new_v4().into(),
            first.into(),
            Uuid::new_v4().into(),
            world.source_user.into(),
            world.target_user.into(),
        ],
    )
    .await;
    assert!(same_source.is_err(), "a source may only have one mirror");
    let same_target = exec(
        db,
        insert_mapping,
        vec![
            Uuid::new_v4().into(),
            Uuid::new_v4().into(),
            first_mirror.into(),
            world.source_user.into(),
            world.target_user.into(),
        ],
    )
    .await;
    assert!(same_target.is_err(), "a mirror may only stand for one source");

    // Crash recovery and repeated cycles must not fork a second mapping.
    exec(
        db,
        "DELETE FROM _mirror_asset_map WHERE source_asset_id = $1",
        vec![second.into()],
    )
    .await?;
    engine.run_cycle(&token).await?;
    engine.run_cycle(&token).await?;

    for column in ["source_asset_id", "target_asset_id"] {
        let repeated = count(
            db,
            &format!(
                "SELECT COUNT(*) AS count FROM (SELECT {column} FROM _mirror_asset_map \
                 GROUP BY {column} HAVING COUNT(*) > 1) d"
            ),
            vec![],
        )
        .await?;
        assert_eq!(repeated, 0, "{column} appears in more than one mapping");
    }
    let mapped = count(db, "SELECT COUNT(*) AS count FROM _mirror_asset_map", vec![]).await?;
    assert_eq!(mapped, 2);
    let mirrors = count(
        db,
        r#"SELECT COUNT(*) AS count FROM asset WHERE "ownerId" = $1"#,
        vec![world.target_user.into()],
    )
    .await?;
    assert_eq!(mirrors, 2);
    Ok(())
}

#[tokio::test]
async fn filename_duplicates_are_skipped_permanently() -> Result<()> {
    let Some(test_db) = setup_host_db().await else {
        return Ok(());
    };
    let db = &test_db.db;
    let world = seed_world(db).await?;

    let own = insert_asset(
        db,
        world.target_user,
        None,
        "/upload/library/bob/IMG_0200.heic",
        "IMG_0200.heic",
        b"own",
        "2024-07-01T18:30:00Z",
    )
    .await?;
    let source = insert_source_asset(db, &world, "IMG_0200.jpg", b"d1", "2024-07-01T09:00:00Z").await?;

    let engine = MirrorEngine::new(db.clone(), world.config(false));
    let token = CancellationToken::new();
    let summary = engine.run_cycle(&token).await?;
    assert_eq!(summary.duplicates_skipped, 1);
    assert_eq!(summary.assets_synced, 0);
    assert_eq!(mirror_of(db, source).await?, None);

    let skipped = count(
        db,
        "SELECT COUNT(*) AS count FROM _mirror_skipped WHERE source_asset_id = $1 AND reason = 'duplicate_filename'",
        vec![source.into()],
    )
    .await?;
    assert_eq!(skipped, 1);

    // The decision sticks even after the colliding upload is gone.
    exec(db, "DELETE FROM asset WHERE id = $1", vec![own.into()]).await?;
    let summary = engine.run_cycle(&token).await?;
    assert!(summary.is_empty());
    assert_eq!(mirror_of(db, source).await?, None);
    Ok(())
}

#[tokio::test]
async fn checksum_collision_skips_the_second_source() -> Result<()> {
    let Some(test_db) = setup_host_db().await else {
        return Ok(());
    };
    let db = &test_db.db;
    let world = seed_world(db).await?;

    insert_source_asset(db, &world, "IMG_0300.jpg", b"same", "2024-08-01T10:00:00Z").await?;
    // Same bytes outside the source library, so the source side accepts it.
    insert_asset(
        db,
        world.source_user,
        None,
        &format!("{}copies/IMG_0300 copy.jpg", world.source_prefix()),
        "IMG_0300 copy.jpg",
        b"same",
        "2024-08-02T10:00:00Z",
    )
    .await?;

    let engine = MirrorEngine::new(db.clone(), world.config(false));
    let summary = engine.run_cycle(&CancellationToken::new()).await?;
    assert_eq!(summary.assets_synced, 1);
    assert_eq!(summary.checksum_skipped, 1);

    let skipped = count(
        db,
        "SELECT COUNT(*) AS count FROM _mirror_skipped WHERE reason = 'duplicate_checksum'",
        vec![],
    )
    .await?;
    assert_eq!(skipped, 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_person_creation_yields_one_mirror() -> Result<()> {
    let Some(test_db) = setup_host_db().await else {
        return Ok(());
    };
    let db = &test_db.db;
    let world = seed_world(db).await?;
    let hana = insert_person(db, &world, world.source_user, "Hana", false).await?;
    let config = world.config(false);
    let files = FileMirror::new(&config.storage);

    let first = db.begin().await?;
    let mut created = Vec::new();
    let first_id = get_or_create_mirrored_person(
        &first,
        &files,
        hana,
        world.source_user,
        world.target_user,
        &mut created,
    )
    .await?
    .context("source person should exist")?;

    let racer = {
        let db = db.clone();
        let config = config.clone();
        let (source_user, target_user) = (world.source_user, world.target_user);
        tokio::spawn(async move {
            let files = FileMirror::new(&config.storage);
            let second = db.begin().await?;
            let mut created = Vec::new();
            let id = get_or_create_mirrored_person(
                &second,
                &files,
                hana,
                source_user,
                target_user,
                &mut created,
            )
            .await?;
            second.commit().await?;
            anyhow::Ok(id)
        })
    };

    // The second transaction waits on the person lock until the first commits.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!racer.is_finished(), "second creator should block on the lock");
    first.commit().await?;

    let second_id = racer.await??;
    assert_eq!(second_id, Some(first_id));

    let persons = target_persons(db, &world).await?;
    assert_eq!(persons.len(), 1);
    assert_eq!(persons[0].id, first_id);
    let mappings = count(
        db,
        "SELECT COUNT(*) AS count FROM _mirror_person_map WHERE source_person_id = $1",
        vec![hana.into()],
    )
    .await?;
    assert_eq!(mappings, 1);
    Ok(())
}

#[tokio::test]
async fn merged_target_person_is_adopted_for_new_faces() -> Result<()> {
    let Some(test_db) = setup_host_db().await else {
        return Ok(());
    };
    let db = &test_db.db;
    let world = seed_world(db).await?;

    let dave = insert_person(db, &world, world.source_user, "Dave", false).await?;
    let first = insert_source_asset(db, &world, "IMG_0400.jpg", b"m1", "2024-09-01T10:00:00Z").await?;
    insert_face(db, first, Some(dave), 20).await?;

    let engine = MirrorEngine::new(db.clone(), world.config(false));
    let token = CancellationToken::new();
    engine.run_cycle(&token).await?;

    let mirrored = target_persons(db, &world).await?;
    assert_eq!(mirrored.len(), 1);
    let original_mirror = mirrored[0].id;

    // The target owner merges the mirrored person into one of their own.
    let survivor = insert_person(db, &world, world.target_user, "Dave (mine)", false).await?;
    exec(
        db,
        r#"UPDATE asset_face SET "personId" = $1 WHERE "personId" = $2"#,
        vec![survivor.into(), original_mirror.into()],
    )
    .await?;
    exec(db, "DELETE FROM person WHERE id = $1", vec![original_mirror.into()]).await?;

    let second = insert_source_asset(db, &world, "IMG_0401.jpg", b"m2", "2024-09-02T10:00:00Z").await?;
    insert_face(db, second, Some(dave), 40).await?;
    engine.run_cycle(&token).await?;

    let second_mirror = mirror_of(db, second).await?.context("second not mirrored")?;
    assert_eq!(face_people(db, second_mirror).await?, vec![Some(survivor)]);

    let persons = target_persons(db, &world).await?;
    assert_eq!(persons.len(), 1, "no replacement person should be created");
    assert_eq!(persons[0].id, survivor);

    let mapped = count(
        db,
        "SELECT COUNT(*) AS count FROM _mirror_person_map WHERE source_person_id = $1 AND target_person_id = $2",
        vec![dave.into(), survivor.into()],
    )
    .await?;
    assert_eq!(mapped, 1);
    Ok(())
}

#[tokio::test]
async fn deleted_sources_and_persons_are_cleaned_up() -> Result<()> {
    let Some(test_db) = setup_host_db().await else {
        return Ok(());
    };
    let db = &test_db.db;
    let world = seed_world(db).await?;

    let erin = insert_person(db, &world, world.source_user, "Erin", true).await?;
    let kept = insert_source_asset(db, &world, "IMG_0500.jpg", b"k1", "2024-10-01T10:00:00Z").await?;
    insert_face(db, kept, Some(erin), 30).await?;
    let dropped = insert_source_asset(db, &world, "IMG_0501.jpg", b"k2", "2024-10-02T10:00:00Z").await?;

    let engine = MirrorEngine::new(db.clone(), world.config(true));
    let token = CancellationToken::new();
    engine.run_cycle(&token).await?;

    let dropped_mirror = mirror_of(db, dropped).await?.context("not mirrored")?;
    let dropped_files = file_paths(db, dropped_mirror).await?;
    let erin_mirror = target_persons(db, &world).await?.remove(0);

    exec(
        db,
        r#"UPDATE asset SET "deletedAt" = now() WHERE id = $1"#,
        vec![dropped.into()],
    )
    .await?;
    exec(db, "DELETE FROM person WHERE id = $1", vec![erin.into()]).await?;

    let summary = engine.run_cycle(&token).await?;
    assert_eq!(summary.assets_cleaned, 1);
    assert_eq!(summary.faces_reassigned, 1);
    assert_eq!(summary.persons_cleaned, 1);

    assert_eq!(mirror_of(db, dropped).await?, None);
    let gone = count(
        db,
        "SELECT COUNT(*) AS count FROM asset WHERE id = $1",
        vec![dropped_mirror.into()],
    )
    .await?;
    assert_eq!(gone, 0);
    for path in dropped_files {
        assert!(!path.exists(), "{} should be unlinked", path.display());
    }
    let album_links = count(
        db,
        r#"SELECT COUNT(*) AS count FROM album_asset WHERE "assetId" = $1"#,
        vec![dropped_mirror.into()],
    )
    .await?;
    assert_eq!(album_links, 0);

    let kept_mirror = mirror_of(db, kept).await?.context("kept mirror missing")?;
    assert_eq!(face_people(db, kept_mirror).await?, vec![None]);
    assert!(target_persons(db, &world).await?.is_empty());
    assert!(!PathBuf::from(&erin_mirror.thumbnail_path).exists());

    assert!(engine.run_cycle(&token).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn person_edits_and_new_faces_flow_to_the_mirror() -> Result<()> {
    let Some(test_db) = setup_host_db().await else {
        return Ok(());
    };
    let db = &test_db.db;
    let world = seed_world(db).await?;

    let frank = insert_person(db, &world, world.source_user, "Frank", false).await?;
    let grace = insert_person(db, &world, world.source_user, "Grace", false).await?;
    let source = insert_source_asset(db, &world, "IMG_0600.jpg", b"p1", "2024-11-01T10:00:00Z").await?;
    let face = insert_face(db, source, Some(frank), 50).await?;

    let engine = MirrorEngine::new(db.clone(), world.config(false));
    let token = CancellationToken::new();
    engine.run_cycle(&token).await?;
    let mirror = mirror_of(db, source).await?.context("not mirrored")?;

    exec(
        db,
        r#"UPDATE person SET name = 'Franklin', "isHidden" = true WHERE id = $1"#,
        vec![frank.into()],
    )
    .await?;
    insert_face(db, source, Some(grace), 300).await?;

    let summary = engine.run_cycle(&token).await?;
    assert_eq!(summary.faces_synced, 1);
    assert_eq!(summary.persons_updated, 2);

    let names: Vec<String> = target_persons(db, &world)
        .await?
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec!["Franklin".to_string(), "Grace".to_string()]);
    assert_eq!(face_people(db, mirror).await?.len(), 2);

    // Reassign the original face on the source side.
    exec(
        db,
        r#"UPDATE asset_face SET "personId" = $1 WHERE id = $2"#,
        vec![grace.into(), face.into()],
    )
    .await?;
    let summary = engine.run_cycle(&token).await?;
    assert_eq!(summary.faces_reassigned, 1);
    let people = face_people(db, mirror).await?;
    assert_eq!(people[0], people[1], "both faces now point at Grace's mirror");
    Ok(())
}

#[tokio::test]
async fn face_watermark_advances_when_nothing_new_was_mirrored() -> Result<()> {
    let Some(test_db) = setup_host_db().await else {
        return Ok(());
    };
    let db = &test_db.db;
    let world = seed_world(db).await?;
    let ivy = insert_person(db, &world, world.source_user, "Ivy", false).await?;
    let source = insert_source_asset(db, &world, "IMG_0650.jpg", b"w1", "2024-11-10T10:00:00Z").await?;
    let face = insert_face(db, source, Some(ivy), 60).await?;

    let engine = MirrorEngine::new(db.clone(), world.config(false));
    let token = CancellationToken::new();
    engine.run_cycle(&token).await?;

    // An edit that leaves the geometry alone: nothing new to mirror.
    exec(
        db,
        r#"UPDATE asset_face SET "updatedAt" = now() WHERE id = $1"#,
        vec![face.into()],
    )
    .await?;
    let stale_pairs = r#"
        SELECT COUNT(*) AS count FROM _mirror_asset_map m
        WHERE EXISTS (
            SELECT 1 FROM asset_face af
            WHERE af."assetId" = m.source_asset_id AND af."updatedAt" > m.synced_at
        )
    "#;
    assert_eq!(count(db, stale_pairs, vec![]).await?, 1);

    let summary = engine.run_cycle(&token).await?;
    assert_eq!(summary.faces_synced, 0);
    assert_eq!(count(db, stale_pairs, vec![]).await?, 0, "pair should not be rescanned");
    Ok(())
}

#[tokio::test]
async fn cancelled_token_stops_before_any_phase() -> Result<()> {
    let Some(test_db) = setup_host_db().await else {
        return Ok(());
    };
    let db = &test_db.db;
    let world = seed_world(db).await?;
    let source = insert_source_asset(db, &world, "IMG_0700.jpg", b"x1", "2024-12-01T10:00:00Z").await?;

    let engine = MirrorEngine::new(db.clone(), world.config(false));
    let token = CancellationToken::new();
    token.cancel();
    let result = engine.run_cycle(&token).await;
    assert!(matches!(result, Err(immich_mirror::error::MirrorError::Cancelled)));
    assert_eq!(mirror_of(db, source).await?, None);
    Ok(())
}
