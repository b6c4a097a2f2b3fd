//! # Person Map Repository

use sea_orm::{
    ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait, QueryFilter, Statement,
};
use uuid::Uuid;

use crate::models::person_map::{Column, Entity, Model};

pub struct PersonMapRepository<'c, C: ConnectionTrait> {
    db: &'c C,
}

impl<'c, C: ConnectionTrait> PersonMapRepository<'c, C> {
    pub fn new(db: &'c C) -> Self {
        Self { db }
    }

    pub async fn find(
        &self,
        source_person_id: Uuid,
        target_user_id: Uuid,
    ) -> Result<Option<Model>, DbErr> {
        Entity::find()
            .filter(Column::SourcePersonId.eq(source_person_id))
            .filter(Column::TargetUserId.eq(target_user_id))
            .one(self.db)
            .await
    }

    /// Inserts the mapping unless one already exists for this source and target owner.
    pub async fn insert_if_absent(
        &self,
        source_person_id: Uuid,
        target_person_id: Uuid,
        source_user_id: Uuid,
        target_user_id: Uuid,
    ) -> Result<bool, DbErr> {
        let result = self
            .db
            .execute(Statement::from_sql_and_values(
                self.db.get_database_backend(),
                r#"
                INSERT INTO _mirror_person_map
                    (id, source_person_id, target_person_id, source_user_id, target_user_id, created_at)
                VALUES ($1, $2, $3, $4, $5, now())
                ON CONFLICT (source_person_id, target_user_id) DO NOTHING
                "#,
                [
                    Uuid::new_v4().into(),
                    source_person_id.into(),
                    target_person_id.into(),
                    source_user_id.into(),
                    target_user_id.into(),
                ],
            ))
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Points an existing mapping at a different target person.
    pub async fn repoint(&self, id: Uuid, target_person_id: Uuid) -> Result<(), DbErr> {
        self.db
            .execute(Statement::from_sql_and_values(
                self.db.get_database_backend(),
                "UPDATE _mirror_person_map SET target_person_id = $2 WHERE id = $1",
                [id.into(), target_person_id.into()],
            ))
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), DbErr> {
        Entity::delete_by_id(id).exec(self.db).await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<u64, DbErr> {
        Entity::find().count(self.db).await
    }
}
