//! Migration to create the person mapping table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(MirrorPersonMap::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MirrorPersonMap::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(MirrorPersonMap::SourcePersonId).uuid().not_null())
                    .col(ColumnDef::new(MirrorPersonMap::TargetPersonId).uuid().not_null())
                    .col(ColumnDef::new(MirrorPersonMap::SourceUserId).uuid().not_null())
                    .col(ColumnDef::new(MirrorPersonMap::TargetUserId).uuid().not_null())
                    .col(
                        ColumnDef::new(MirrorPersonMap::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // A source identity maps to at most one mirrored identity per target owner.
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("uq_mirror_person_map_source_target_user")
                    .table(MirrorPersonMap::Table)
                    .col(MirrorPersonMap::SourcePersonId)
                    .col(MirrorPersonMap::TargetUserId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_mirror_person_map_target_person")
                    .table(MirrorPersonMap::Table)
                    .col(MirrorPersonMap::TargetPersonId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(MirrorPersonMap::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum MirrorPersonMap {
    #[sea_orm(iden = "_mirror_person_map")]
    Table,
    Id,
    SourcePersonId,
    TargetPersonId,
    SourceUserId,
    TargetUserId,
    CreatedAt,
}
