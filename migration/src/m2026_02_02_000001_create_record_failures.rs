//! Migration to create the per-record failure ledger.
//!
//! Tracks transient failures per source asset so a retry ceiling can move a
//! permanently broken record onto the skip list.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(MirrorRecordFailures::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MirrorRecordFailures::SourceAssetId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(MirrorRecordFailures::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(MirrorRecordFailures::LastError).text().not_null())
                    .col(
                        ColumnDef::new(MirrorRecordFailures::LastFailedAt)
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
            .drop_table(Table::drop().table(MirrorRecordFailures::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum MirrorRecordFailures {
    #[sea_orm(iden = "_mirror_record_failures")]
    Table,
    SourceAssetId,
    Attempts,
    LastError,
    LastFailedAt,
}
