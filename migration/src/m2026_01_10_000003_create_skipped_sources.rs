//! Migration to create the skipped-source denylist.
//!
//! Rows are only ever appended by the engine; the maintenance CLI is the
//! only path that clears them.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(MirrorSkipped::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MirrorSkipped::SourceAssetId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(MirrorSkipped::Reason).text().not_null())
                    .col(
                        ColumnDef::new(MirrorSkipped::SkippedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(MirrorSkipped::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum MirrorSkipped {
    #[sea_orm(iden = "_mirror_skipped")]
    Table,
    SourceAssetId,
    Reason,
    SkippedAt,
}
