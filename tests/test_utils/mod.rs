//! Test utilities for database testing.
//!
//! Every test gets a fresh Postgres database holding a minimal copy of the
//! host schema the engine relies on. The server comes from
//! `MIRROR_TEST_DATABASE_URL` when set, otherwise from a throwaway
//! testcontainers Postgres. When neither is available the caller skips.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use immich_mirror::config::{AppConfig, SyncJob};
use immich_mirror::db;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, FromQueryResult, Statement, Value};
use tempfile::TempDir;
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::testcontainers::{ContainerAsync, runners::AsyncRunner};
use uuid::Uuid;

/// Minimal host schema: the tables, keys and cascades the engine depends on.
/// `bytea` stands in for vector columns.
pub const HOST_FIXTURE_SQL: &str = r#"
CREATE TABLE "user" (
    id uuid PRIMARY KEY,
    email text NOT NULL DEFAULT '',
    name text NOT NULL DEFAULT '',
    "deletedAt" timestamptz
);

CREATE TABLE library (
    id uuid PRIMARY KEY,
    "ownerId" uuid NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
    name text NOT NULL DEFAULT '',
    "deletedAt" timestamptz
);

CREATE TABLE asset (
    id uuid PRIMARY KEY,
    "deviceAssetId" text NOT NULL,
    "ownerId" uuid NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
    "deviceId" text NOT NULL,
    type text NOT NULL DEFAULT 'IMAGE',
    "originalPath" text NOT NULL,
    "fileCreatedAt" timestamptz NOT NULL,
    "fileModifiedAt" timestamptz NOT NULL,
    "isFavorite" boolean NOT NULL DEFAULT false,
    duration text,
    "encodedVideoPath" text DEFAULT '',
    checksum bytea NOT NULL,
    "livePhotoVideoId" uuid,
    "originalFileName" text NOT NULL,
    thumbhash bytea,
    "isOffline" boolean NOT NULL DEFAULT false,
    "libraryId" uuid REFERENCES library(id) ON DELETE CASCADE,
    "isExternal" boolean NOT NULL DEFAULT false,
    "localDateTime" timestamptz NOT NULL,
    "stackId" uuid,
    "duplicateId" uuid,
    status text NOT NULL DEFAULT 'active',
    visibility text NOT NULL DEFAULT 'timeline',
    width integer,
    height integer,
    "isEdited" boolean NOT NULL DEFAULT false,
    "deletedAt" timestamptz,
    "updatedAt" timestamptz NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX asset_owner_library_checksum
    ON asset ("ownerId", "libraryId", checksum) WHERE "libraryId" IS NOT NULL;

CREATE TABLE asset_exif (
    "assetId" uuid PRIMARY KEY REFERENCES asset(id) ON DELETE CASCADE,
    make text,
    model text,
    "dateTimeOriginal" timestamptz,
    "timeZone" text,
    city text,
    description text NOT NULL DEFAULT ''
);

CREATE TABLE asset_file (
    id uuid PRIMARY KEY,
    "assetId" uuid NOT NULL REFERENCES asset(id) ON DELETE CASCADE,
    type text NOT NULL,
    path text NOT NULL,
    "isEdited" boolean NOT NULL DEFAULT false,
    "isProgressive" boolean NOT NULL DEFAULT false
);

CREATE TABLE asset_job_status (
    "assetId" uuid PRIMARY KEY REFERENCES asset(id) ON DELETE CASCADE,
    "facesRecognizedAt" timestamptz,
    "metadataExtractedAt" timestamptz,
    "duplicatesDetectedAt" timestamptz,
    "ocrAt" timestamptz
);

CREATE TABLE smart_search (
    "assetId" uuid PRIMARY KEY REFERENCES asset(id) ON DELETE CASCADE,
    embedding bytea NOT NULL
);

CREATE TABLE person (
    id uuid PRIMARY KEY,
    "ownerId" uuid NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
    name text NOT NULL DEFAULT '',
    "thumbnailPath" text NOT NULL DEFAULT '',
    "isHidden" boolean NOT NULL DEFAULT false,
    "birthDate" date,
    "faceAssetId" uuid,
    "isFavorite" boolean NOT NULL DEFAULT false,
    color text
);

CREATE TABLE asset_face (
    id uuid PRIMARY KEY,
    "assetId" uuid NOT NULL REFERENCES asset(id) ON DELETE CASCADE,
    "personId" uuid REFERENCES person(id) ON DELETE SET NULL,
    "imageWidth" integer NOT NULL DEFAULT 0,
    "imageHeight" integer NOT NULL DEFAULT 0,
    "boundingBoxX1" integer NOT NULL DEFAULT 0,
    "boundingBoxY1" integer NOT NULL DEFAULT 0,
    "boundingBoxX2" integer NOT NULL DEFAULT 0,
    "boundingBoxY2" integer NOT NULL DEFAULT 0,
    "sourceType" text NOT NULL DEFAULT 'machine-learning',
    "deletedAt" timestamptz,
    "updatedAt" timestamptz NOT NULL DEFAULT now(),
    "isVisible" boolean NOT NULL DEFAULT true
);

CREATE TABLE face_search (
    "faceId" uuid PRIMARY KEY REFERENCES asset_face(id) ON DELETE CASCADE,
    embedding bytea NOT NULL
);

CREATE TABLE album (
    id uuid PRIMARY KEY,
    "ownerId" uuid NOT NULL REFERENCES "user"(id) ON DELETE CASCADE,
    "albumName" text NOT NULL DEFAULT '',
    "updatedAt" timestamptz NOT NULL DEFAULT now(),
    "deletedAt" timestamptz
);

CREATE TABLE album_asset (
    "albumId" uuid NOT NULL REFERENCES album(id) ON DELETE CASCADE,
    "assetId" uuid NOT NULL REFERENCES asset(id) ON DELETE CASCADE,
    PRIMARY KEY ("albumId", "assetId")
);
"#;

/// A fresh database with the host fixture and tracking tables applied.
pub struct TestDb {
    pub db: DatabaseConnection,
    pub url: String,
    _container: Option<ContainerAsync<Postgres>>,
}

/// Returns `None`, after printing why, when no Postgres is reachable.
pub async fn setup_host_db() -> Option<TestDb> {
    match try_setup_host_db().await {
        Ok(test_db) => Some(test_db),
        Err(err) => {
            eprintln!("skipping database test: {err:#}");
            None
        }
    }
}

async fn try_setup_host_db() -> Result<TestDb> {
    let (server_url, container) = match std::env::var("MIRROR_TEST_DATABASE_URL") {
        Ok(url) if !url.is_empty() => (url, None),
        _ => {
            let container = Postgres::default()
                .start()
                .await
                .context("starting postgres container")?;
            let host = container.get_host().await?;
            let port = container.get_host_port_ipv4(5432).await?;
            (
                format!("postgres://postgres:postgres@{host}:{port}/postgres"),
                Some(container),
            )
        }
    };

    let admin = Database::connect(server_url.as_str())
        .await
        .context("connecting to test postgres")?;
    let name = format!("mirror_test_{}", Uuid::new_v4().simple());
    admin
        .execute_unprepared(&format!("CREATE DATABASE {name}"))
        .await?;
    admin.close().await?;

    let url = replace_database(&server_url, &name)?;
    let mut config = AppConfig::default();
    config.database_url = url.clone();
    config.db_max_connections = 5;
    let db = db::init_pool(&config).await?;
    db.execute_unprepared(HOST_FIXTURE_SQL).await?;
    db::ensure_tracking_tables(&db).await?;

    Ok(TestDb {
        db,
        url,
        _container: container,
    })
}

fn replace_database(server_url: &str, name: &str) -> Result<String> {
    let mut url = url::Url::parse(server_url).context("parsing test database url")?;
    url.set_path(&format!("/{name}"));
    Ok(url.to_string())
}

/// Users, libraries, album and storage roots for one source/target pair.
pub struct World {
    pub source_user: Uuid,
    pub target_user: Uuid,
    pub source_library: Uuid,
    pub target_library: Uuid,
    pub album: Uuid,
    pub storage: TempDir,
}

impl World {
    pub fn upload_root(&self) -> PathBuf {
        self.storage.path().join("upload")
    }

    pub fn external_root(&self) -> PathBuf {
        self.storage.path().join("external")
    }

    pub fn source_prefix(&self) -> String {
        format!("{}/alice/", self.external_root().display())
    }

    pub fn target_prefix(&self) -> String {
        format!("{}/bob/", self.external_root().display())
    }

    pub fn job(&self, album: bool) -> SyncJob {
        SyncJob {
            name: "alice-to-bob".to_string(),
            source_user_id: self.source_user,
            target_user_id: self.target_user,
            target_library_id: self.target_library,
            source_path_prefix: self.source_prefix(),
            target_path_prefix: self.target_prefix(),
            album_id: album.then_some(self.album),
        }
    }

    pub fn config(&self, album: bool) -> Arc<AppConfig> {
        let mut config = AppConfig::default();
        config.storage.upload_root = self.upload_root();
        config.storage.external_library_root = self.external_root();
        config.schema.clip_dimension = 0;
        config.schema.face_dimension = 0;
        config.sync.batch_size = 2;
        config.sync.phase_timeout_seconds = 60;
        config.jobs = vec![self.job(album)];
        Arc::new(config)
    }
}

pub async fn seed_world(db: &DatabaseConnection) -> Result<World> {
    let world = World {
        source_user: Uuid::new_v4(),
        target_user: Uuid::new_v4(),
        source_library: Uuid::new_v4(),
        target_library: Uuid::new_v4(),
        album: Uuid::new_v4(),
        storage: tempfile::tempdir()?,
    };
    std::fs::create_dir_all(world.upload_root())?;
    std::fs::create_dir_all(world.external_root())?;

    exec(
        db,
        r#"INSERT INTO "user" (id, email, name) VALUES ($1, 'alice@example.com', 'Alice'), ($2, 'bob@example.com', 'Bob')"#,
        vec![world.source_user.into(), world.target_user.into()],
    )
    .await?;
    exec(
        db,
        r#"INSERT INTO library (id, "ownerId", name) VALUES ($1, $2, 'alice'), ($3, $4, 'bob-mirror')"#,
        vec![
            world.source_library.into(),
            world.source_user.into(),
            world.target_library.into(),
            world.target_user.into(),
        ],
    )
    .await?;
    exec(
        db,
        r#"INSERT INTO album (id, "ownerId", "albumName") VALUES ($1, $2, 'From Alice')"#,
        vec![world.album.into(), world.target_user.into()],
    )
    .await?;
    Ok(world)
}

pub async fn exec(db: &DatabaseConnection, sql: &str, values: Vec<Value>) -> Result<u64> {
    let result = db
        .execute(Statement::from_sql_and_values(
            db.get_database_backend(),
            sql,
            values,
        ))
        .await?;
    Ok(result.rows_affected())
}

#[derive(Debug, FromQueryResult)]
struct CountRow {
    count: i64,
}

pub async fn count(db: &DatabaseConnection, sql: &str, values: Vec<Value>) -> Result<i64> {
    let row = CountRow::find_by_statement(Statement::from_sql_and_values(
        db.get_database_backend(),
        sql,
        values,
    ))
    .one(db)
    .await?
    .context("count query returned no row")?;
    Ok(row.count)
}

/// Writes a file, creating parent directories.
pub fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, b"derived")?;
    Ok(())
}

/// A fully processed source asset with exif, job status, embedding and one
/// thumbnail file on disk. Returns the asset id.
pub async fn insert_source_asset(
    db: &DatabaseConnection,
    world: &World,
    file_name: &str,
    checksum: &[u8],
    captured_at: &str,
) -> Result<Uuid> {
    let id = insert_asset(
        db,
        world.source_user,
        Some(world.source_library),
        &format!("{}{}", world.source_prefix(), file_name),
        file_name,
        checksum,
        captured_at,
    )
    .await?;

    let thumb = world
        .upload_root()
        .join("thumbs")
        .join(world.source_user.to_string())
        .join(format!("{id}-thumbnail.webp"));
    touch(&thumb)?;
    exec(
        db,
        r#"INSERT INTO asset_file (id, "assetId", type, path) VALUES ($1, $2, 'thumbnail', $3)"#,
        vec![
            Uuid::new_v4().into(),
            id.into(),
            thumb.display().to_string().into(),
        ],
    )
    .await?;
    Ok(id)
}

/// Inserts an asset with exif, completed job status and an embedding.
pub async fn insert_asset(
    db: &DatabaseConnection,
    owner: Uuid,
    library: Option<Uuid>,
    original_path: &str,
    file_name: &str,
    checksum: &[u8],
    captured_at: &str,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    exec(
        db,
        r#"
        INSERT INTO asset (
            id, "deviceAssetId", "ownerId", "deviceId", "originalPath",
            "fileCreatedAt", "fileModifiedAt", checksum, "originalFileName",
            "libraryId", "isExternal", "localDateTime", "isFavorite"
        )
        VALUES ($1, $2, $3, 'test-device', $4, $5::timestamptz, $5::timestamptz, $6, $2,
                $7, $8, $5::timestamptz, true)
        "#,
        vec![
            id.into(),
            file_name.to_string().into(),
            owner.into(),
            original_path.to_string().into(),
            captured_at.to_string().into(),
            checksum.to_vec().into(),
            library.into(),
            library.is_some().into(),
        ],
    )
    .await?;
    exec(
        db,
        r#"
        INSERT INTO asset_exif ("assetId", make, "dateTimeOriginal", city)
        VALUES ($1, 'TestCam', $2::timestamptz, 'Lisbon')
        "#,
        vec![id.into(), captured_at.to_string().into()],
    )
    .await?;
    exec(
        db,
        r#"
        INSERT INTO asset_job_status ("assetId", "facesRecognizedAt", "metadataExtractedAt")
        VALUES ($1, now(), now())
        "#,
        vec![id.into()],
    )
    .await?;
    exec(
        db,
        r#"INSERT INTO smart_search ("assetId", embedding) VALUES ($1, '\x0102'::bytea)"#,
        vec![id.into()],
    )
    .await?;
    Ok(id)
}

/// Inserts a person owned by `owner`, with a face-crop file when `thumbnail` is set.
pub async fn insert_person(
    db: &DatabaseConnection,
    world: &World,
    owner: Uuid,
    name: &str,
    thumbnail: bool,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let path = if thumbnail {
        let path = world
            .upload_root()
            .join("thumbs")
            .join(owner.to_string())
            .join(format!("{id}.jpeg"));
        touch(&path)?;
        path.display().to_string()
    } else {
        String::new()
    };
    exec(
        db,
        r#"INSERT INTO person (id, "ownerId", name, "thumbnailPath") VALUES ($1, $2, $3, $4)"#,
        vec![id.into(), owner.into(), name.to_string().into(), path.into()],
    )
    .await?;
    Ok(id)
}

/// Inserts a face with an embedding; `corner` offsets the bounding box.
pub async fn insert_face(
    db: &DatabaseConnection,
    asset: Uuid,
    person: Option<Uuid>,
    corner: i32,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    exec(
        db,
        r#"
        INSERT INTO asset_face (
            id, "assetId", "personId", "imageWidth", "imageHeight",
            "boundingBoxX1", "boundingBoxY1", "boundingBoxX2", "boundingBoxY2"
        )
        VALUES ($1, $2, $3, 1000, 800, $4, $4, $5, $5)
        "#,
        vec![
            id.into(),
            asset.into(),
            person.into(),
            corner.into(),
            (corner + 100).into(),
        ],
    )
    .await?;
    exec(
        db,
        r#"INSERT INTO face_search ("faceId", embedding) VALUES ($1, '\x0a0b'::bytea)"#,
        vec![id.into()],
    )
    .await?;
    Ok(id)
}

/// The target asset mirrored from `source`, if any.
pub async fn mirror_of(db: &DatabaseConnection, source: Uuid) -> Result<Option<Uuid>> {
    #[derive(FromQueryResult)]
    struct Row {
        target_asset_id: Uuid,
    }
    let row = Row::find_by_statement(Statement::from_sql_and_values(
        db.get_database_backend(),
        "SELECT target_asset_id FROM _mirror_asset_map WHERE source_asset_id = $1",
        [source.into()],
    ))
    .one(db)
    .await?;
    Ok(row.map(|row| row.target_asset_id))
}
