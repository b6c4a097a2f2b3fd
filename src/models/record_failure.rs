//! Per-record failure counter for the `_mirror_record_failures` table.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "_mirror_record_failures")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub source_asset_id: Uuid,

    /// Consecutive transient failures since the last success
    pub attempts: i32,

    #[sea_orm(column_type = "Text")]
    pub last_error: String,

    pub last_failed_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
