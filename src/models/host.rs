//! Typed rows read from the host application's tables.
//!
//! Host columns are camelCase; every query aliases them to the snake_case
//! field names below.

use sea_orm::FromQueryResult;
use uuid::Uuid;

/// A source asset eligible for mirroring.
#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub struct SourceAsset {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub original_path: String,
    pub original_file_name: String,
}

/// A derived file (thumbnail, preview, encoded video) attached to an asset.
#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub struct DerivedFile {
    pub id: Uuid,
    pub path: String,
}

/// A live face region on a source asset.
#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub struct SourceFace {
    pub id: Uuid,
    pub person_id: Option<Uuid>,
}

/// A mapped asset pair with its owners.
#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub struct MappedAsset {
    pub source_asset_id: Uuid,
    pub target_asset_id: Uuid,
    pub source_user_id: Uuid,
    pub target_user_id: Uuid,
}

/// A person's owner and face-crop path.
#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub struct PersonThumbnail {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub thumbnail_path: String,
}

/// Count of mirrored faces pointing at a surviving target person.
#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub struct AdoptionCandidate {
    pub target_person_id: Uuid,
    pub votes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub(crate) struct IdRow {
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub(crate) struct FlagRow {
    pub flag: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub(crate) struct PathRow {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub(crate) struct CountRow {
    pub count: i64,
}
