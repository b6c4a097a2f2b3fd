//! Asset mapping entity for the `_mirror_asset_map` table.
//!
//! One row per mirrored asset; the engine's record of "already synced".

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "_mirror_asset_map")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Unique: a source asset is mirrored at most once
    #[sea_orm(unique)]
    pub source_asset_id: Uuid,

    /// Unique: a mirrored asset has exactly one source
    #[sea_orm(unique)]
    pub target_asset_id: Uuid,

    pub source_user_id: Uuid,
    pub target_user_id: Uuid,

    /// Creation time, later advanced as the incremental face watermark
    pub synced_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
