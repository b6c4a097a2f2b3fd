//! # Skip List Repository
//!
//! `_mirror_skipped` is append-only from the engine's side. Only the admin
//! tool clears entries.

use sea_orm::{
    ColumnTrait, ConnectionTrait, DbErr, EntityTrait, FromQueryResult, QueryFilter, Statement,
};
use uuid::Uuid;

use crate::models::SkipReason;
use crate::models::skipped_source::{Column, Entity};

#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub struct ReasonCount {
    pub reason: String,
    pub count: i64,
}

pub struct SkipListRepository<'c, C: ConnectionTrait> {
    db: &'c C,
}

impl<'c, C: ConnectionTrait> SkipListRepository<'c, C> {
    pub fn new(db: &'c C) -> Self {
        Self { db }
    }

    /// Returns true when the source was newly skipped.
    pub async fn record(&self, source_asset_id: Uuid, reason: SkipReason) -> Result<bool, DbErr> {
        let result = self
            .db
            .execute(Statement::from_sql_and_values(
                self.db.get_database_backend(),
                r#"
                INSERT INTO _mirror_skipped (source_asset_id, reason, skipped_at)
                VALUES ($1, $2, now())
                ON CONFLICT (source_asset_id) DO NOTHING
                "#,
                [source_asset_id.into(), reason.as_str().into()],
            ))
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn record_many(&self, source_asset_ids: &[Uuid], reason: SkipReason) -> Result<u64, DbErr> {
        if source_asset_ids.is_empty() {
            return Ok(0);
        }
        let result = self
            .db
            .execute(Statement::from_sql_and_values(
                self.db.get_database_backend(),
                r#"
                INSERT INTO _mirror_skipped (source_asset_id, reason, skipped_at)
                SELECT unnest($1::uuid[]), $2, now()
                ON CONFLICT (source_asset_id) DO NOTHING
                "#,
                [source_asset_ids.to_vec().into(), reason.as_str().into()],
            ))
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn is_skipped(&self, source_asset_id: Uuid) -> Result<bool, DbErr> {
        Ok(Entity::find_by_id(source_asset_id).one(self.db).await?.is_some())
    }

    /// Removes skip entries, all of them or those with one reason.
    pub async fn clear(&self, reason: Option<&str>) -> Result<u64, DbErr> {
        let mut delete = Entity::delete_many();
        if let Some(reason) = reason {
            delete = delete.filter(Column::Reason.eq(reason));
        }
        Ok(delete.exec(self.db).await?.rows_affected)
    }

    pub async fn count_by_reason(&self) -> Result<Vec<ReasonCount>, DbErr> {
        ReasonCount::find_by_statement(Statement::from_string(
            self.db.get_database_backend(),
            "SELECT reason, count(*) AS count FROM _mirror_skipped GROUP BY reason ORDER BY reason",
        ))
        .all(self.db)
        .await
    }
}
