//! Skip list entity for the `_mirror_skipped` table.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

/// Append-only denylist of source assets that are never mirrored again.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "_mirror_skipped")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub source_asset_id: Uuid,

    /// One of [`SkipReason`](super::SkipReason)'s string forms
    pub reason: String,

    pub skipped_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
