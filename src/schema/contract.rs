//! The host tables and columns the engine reads and writes.

/// Columns read or filtered on, per host table.
pub const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    (
        "asset",
        &[
            "id",
            "deviceAssetId",
            "ownerId",
            "deviceId",
            "type",
            "originalPath",
            "fileCreatedAt",
            "fileModifiedAt",
            "isFavorite",
            "duration",
            "encodedVideoPath",
            "checksum",
            "livePhotoVideoId",
            "originalFileName",
            "thumbhash",
            "isOffline",
            "libraryId",
            "isExternal",
            "localDateTime",
            "stackId",
            "duplicateId",
            "status",
            "visibility",
            "width",
            "height",
            "isEdited",
            "deletedAt",
        ],
    ),
    ("asset_exif", &["assetId", "dateTimeOriginal"]),
    (
        "asset_file",
        &["id", "assetId", "type", "path", "isEdited", "isProgressive"],
    ),
    (
        "asset_job_status",
        &[
            "assetId",
            "facesRecognizedAt",
            "metadataExtractedAt",
            "duplicatesDetectedAt",
            "ocrAt",
        ],
    ),
    ("smart_search", &["assetId", "embedding"]),
    (
        "asset_face",
        &[
            "id",
            "assetId",
            "personId",
            "imageWidth",
            "imageHeight",
            "boundingBoxX1",
            "boundingBoxY1",
            "boundingBoxX2",
            "boundingBoxY2",
            "sourceType",
            "deletedAt",
            "updatedAt",
            "isVisible",
        ],
    ),
    ("face_search", &["faceId", "embedding"]),
    (
        "person",
        &[
            "id",
            "ownerId",
            "name",
            "thumbnailPath",
            "isHidden",
            "birthDate",
            "faceAssetId",
            "isFavorite",
            "color",
        ],
    ),
    ("album", &["id", "ownerId", "updatedAt", "deletedAt"]),
    ("album_asset", &["albumId", "assetId"]),
    ("library", &["id", "ownerId", "deletedAt"]),
    ("user", &["id", "deletedAt"]),
];

/// Columns copied verbatim into the mirrored asset row.
pub const ASSET_COPY_COLUMNS: &[&str] = &[
    "deviceAssetId",
    "deviceId",
    "type",
    "fileCreatedAt",
    "fileModifiedAt",
    "duration",
    "encodedVideoPath",
    "checksum",
    "originalFileName",
    "thumbhash",
    "isOffline",
    "localDateTime",
    "status",
    "visibility",
    "width",
    "height",
    "isEdited",
];

/// Descriptive metadata copied into the mirrored exif row, when the live table has it.
pub const EXIF_COPY_COLUMNS: &[&str] = &[
    "make",
    "model",
    "exifImageWidth",
    "exifImageHeight",
    "fileSizeInByte",
    "orientation",
    "dateTimeOriginal",
    "modifyDate",
    "lensModel",
    "fNumber",
    "focalLength",
    "iso",
    "latitude",
    "longitude",
    "city",
    "state",
    "country",
    "description",
    "fps",
    "exposureTime",
    "livePhotoCID",
    "timeZone",
    "projectionType",
    "profileDescription",
    "colorspace",
    "bitsPerSample",
    "autoStackId",
    "rating",
    "tags",
    "lockedProperties",
];

/// Columns each insert supplies. A NOT NULL column without default that is
/// missing here makes every insert into that table fail.
pub fn inserted_columns(table: &str) -> Option<Vec<&'static str>> {
    let columns: Vec<&'static str> = match table {
        "asset" => {
            let mut cols = vec![
                "id",
                "ownerId",
                "originalPath",
                "isFavorite",
                "livePhotoVideoId",
                "libraryId",
                "isExternal",
                "stackId",
                "duplicateId",
            ];
            cols.extend_from_slice(ASSET_COPY_COLUMNS);
            cols
        }
        "asset_exif" => {
            let mut cols = vec!["assetId"];
            cols.extend_from_slice(EXIF_COPY_COLUMNS);
            cols
        }
        "asset_file" => vec!["id", "assetId", "type", "path", "isEdited", "isProgressive"],
        "asset_job_status" => vec![
            "assetId",
            "facesRecognizedAt",
            "metadataExtractedAt",
            "duplicatesDetectedAt",
            "ocrAt",
        ],
        "smart_search" => vec!["assetId", "embedding"],
        "asset_face" => vec![
            "id",
            "assetId",
            "personId",
            "imageWidth",
            "imageHeight",
            "boundingBoxX1",
            "boundingBoxY1",
            "boundingBoxX2",
            "boundingBoxY2",
            "sourceType",
            "isVisible",
        ],
        "face_search" => vec!["faceId", "embedding"],
        "person" => vec![
            "id",
            "ownerId",
            "name",
            "thumbnailPath",
            "isHidden",
            "birthDate",
            "faceAssetId",
            "isFavorite",
            "color",
        ],
        "album_asset" => vec!["albumId", "assetId"],
        _ => return None,
    };
    Some(columns)
}

/// Tables the engine inserts into.
pub const INSERT_TABLES: &[&str] = &[
    "asset",
    "asset_exif",
    "asset_file",
    "asset_job_status",
    "smart_search",
    "asset_face",
    "face_search",
    "person",
    "album_asset",
];

/// Children of `asset` that must be removed by `ON DELETE CASCADE`.
pub const CASCADE_CHILDREN: &[&str] = &[
    "asset_exif",
    "asset_file",
    "asset_face",
    "smart_search",
    "asset_job_status",
];

/// Column sets that back `ON CONFLICT` clauses.
pub const UNIQUE_CONSTRAINTS: &[(&str, &[&str])] = &[
    ("face_search", &["faceId"]),
    ("album_asset", &["albumId", "assetId"]),
];

/// Vector columns whose width must match the configured model.
pub const VECTOR_COLUMNS: &[(&str, &str, VectorKind)] = &[
    ("smart_search", "embedding", VectorKind::Clip),
    ("face_search", "embedding", VectorKind::Face),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorKind {
    Clip,
    Face,
}

pub fn required_tables() -> Vec<String> {
    REQUIRED_COLUMNS
        .iter()
        .map(|(table, _)| (*table).to_string())
        .collect()
}
