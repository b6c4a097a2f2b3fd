//! Database migrations for the mirror engine's own tracking tables.
//!
//! Host tables are never created or altered here; only the `_mirror_*`
//! bookkeeping tables the engine owns.

pub use sea_orm_migration::prelude::*;

mod m2026_01_10_000001_create_asset_map;
mod m2026_01_10_000002_create_person_map;
mod m2026_01_10_000003_create_skipped_sources;
mod m2026_02_02_000001_create_record_failures;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migration_table_name() -> DynIden {
        Alias::new("_mirror_migrations").into_iden()
    }

    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_10_000001_create_asset_map::Migration),
            Box::new(m2026_01_10_000002_create_person_map::Migration),
            Box::new(m2026_01_10_000003_create_skipped_sources::Migration),
            Box::new(m2026_02_02_000001_create_record_failures::Migration),
        ]
    }
}
