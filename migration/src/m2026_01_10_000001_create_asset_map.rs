//! Migration to create the asset mapping table.
//!
//! One row per mirrored asset. Both the source and the target asset id are
//! unique so a source is mirrored at most once and a mirror has one source.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(MirrorAssetMap::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MirrorAssetMap::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(MirrorAssetMap::SourceAssetId)
                            .uuid()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(MirrorAssetMap::TargetAssetId)
                            .uuid()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(MirrorAssetMap::SourceUserId).uuid().not_null())
                    .col(ColumnDef::new(MirrorAssetMap::TargetUserId).uuid().not_null())
                    .col(
                        ColumnDef::new(MirrorAssetMap::SyncedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_mirror_asset_map_target_user")
                    .table(MirrorAssetMap::Table)
                    .col(MirrorAssetMap::TargetUserId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(MirrorAssetMap::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum MirrorAssetMap {
    #[sea_orm(iden = "_mirror_asset_map")]
    Table,
    Id,
    SourceAssetId,
    TargetAssetId,
    SourceUserId,
    TargetUserId,
    SyncedAt,
}
