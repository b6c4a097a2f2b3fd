//! # Record Failure Repository
//!
//! Counts consecutive transient failures per source asset so a record that
//! can never succeed is eventually skipped instead of retried forever.

use sea_orm::{ConnectionTrait, DbErr, EntityTrait, PaginatorTrait, Statement};
use uuid::Uuid;

use crate::models::record_failure::Entity;

pub struct FailureRepository<'c, C: ConnectionTrait> {
    db: &'c C,
}

impl<'c, C: ConnectionTrait> FailureRepository<'c, C> {
    pub fn new(db: &'c C) -> Self {
        Self { db }
    }

    /// Bumps the failure counter and returns the new attempt count.
    pub async fn record(&self, source_asset_id: Uuid, error: &str) -> Result<i32, DbErr> {
        let row = self
            .db
            .query_one(Statement::from_sql_and_values(
                self.db.get_database_backend(),
                r#"
                INSERT INTO _mirror_record_failures (source_asset_id, attempts, last_error, last_failed_at)
                VALUES ($1, 1, $2, now())
                ON CONFLICT (source_asset_id) DO UPDATE
                SET attempts = _mirror_record_failures.attempts + 1,
                    last_error = EXCLUDED.last_error,
                    last_failed_at = EXCLUDED.last_failed_at
                RETURNING attempts
                "#,
                [source_asset_id.into(), error.into()],
            ))
            .await?
            .ok_or_else(|| DbErr::RecordNotInserted)?;
        row.try_get("", "attempts")
    }

    pub async fn clear(&self, source_asset_id: Uuid) -> Result<(), DbErr> {
        Entity::delete_by_id(source_asset_id).exec(self.db).await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<u64, DbErr> {
        Entity::find().count(self.db).await
    }
}
