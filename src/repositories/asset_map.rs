//! # Asset Map Repository
//!
//! Reads and writes `_mirror_asset_map`. Every method takes whatever
//! connection or transaction the caller is working in.

use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, Statement,
};
use uuid::Uuid;

use crate::models::asset_map::{ActiveModel, Column, Entity};

pub struct AssetMapRepository<'c, C: ConnectionTrait> {
    db: &'c C,
}

impl<'c, C: ConnectionTrait> AssetMapRepository<'c, C> {
    pub fn new(db: &'c C) -> Self {
        Self { db }
    }

    /// Records a freshly mirrored asset. Fails on either unique key.
    pub async fn insert(
        &self,
        source_asset_id: Uuid,
        target_asset_id: Uuid,
        source_user_id: Uuid,
        target_user_id: Uuid,
    ) -> Result<(), DbErr> {
        let row = ActiveModel {
            id: Set(Uuid::new_v4()),
            source_asset_id: Set(source_asset_id),
            target_asset_id: Set(target_asset_id),
            source_user_id: Set(source_user_id),
            target_user_id: Set(target_user_id),
            synced_at: Set(chrono::Utc::now().fixed_offset()),
        };
        Entity::insert(row).exec_without_returning(self.db).await?;
        Ok(())
    }

    /// Recreates a mapping lost after a crash. Returns false when either side
    /// is already mapped.
    pub async fn insert_recovered(
        &self,
        source_asset_id: Uuid,
        target_asset_id: Uuid,
        source_user_id: Uuid,
        target_user_id: Uuid,
    ) -> Result<bool, DbErr> {
        let result = self
            .db
            .execute(Statement::from_sql_and_values(
                self.db.get_database_backend(),
                r#"
                INSERT INTO _mirror_asset_map
                    (id, source_asset_id, target_asset_id, source_user_id, target_user_id, synced_at)
                VALUES ($1, $2, $3, $4, $5, now())
                ON CONFLICT DO NOTHING
                "#,
                [
                    Uuid::new_v4().into(),
                    source_asset_id.into(),
                    target_asset_id.into(),
                    source_user_id.into(),
                    target_user_id.into(),
                ],
            ))
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_by_target(&self, target_asset_id: Uuid) -> Result<u64, DbErr> {
        let result = Entity::delete_many()
            .filter(Column::TargetAssetId.eq(target_asset_id))
            .exec(self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Advances the incremental face watermark for one pair.
    pub async fn touch_watermark(&self, source_asset_id: Uuid) -> Result<(), DbErr> {
        self.db
            .execute(Statement::from_sql_and_values(
                self.db.get_database_backend(),
                "UPDATE _mirror_asset_map SET synced_at = now() WHERE source_asset_id = $1",
                [source_asset_id.into()],
            ))
            .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<u64, DbErr> {
        Entity::find().count(self.db).await
    }
}
