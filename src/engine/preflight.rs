//! Startup check that every job points at live host records.

use sea_orm::{ConnectionTrait, FromQueryResult};
use tracing::info;

use super::statement;
use crate::config::SyncJob;
use crate::error::{MirrorError, map_db_err};

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromQueryResult)]
pub struct JobReferences {
    pub source_user: bool,
    pub target_user: bool,
    pub library: bool,
    pub album: bool,
}

impl JobReferences {
    /// Human-readable problems for `job`, empty when everything resolves.
    pub fn problems(&self, job: &SyncJob) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.source_user {
            problems.push(format!("source user {} does not exist", job.source_user_id));
        }
        if !self.target_user {
            problems.push(format!("target user {} does not exist", job.target_user_id));
        }
        if !self.library {
            problems.push(format!(
                "library {} does not exist or is not owned by the target user",
                job.target_library_id
            ));
        }
        if !self.album
            && let Some(album) = job.album_id
        {
            problems.push(format!(
                "album {album} does not exist or is not owned by the target user"
            ));
        }
        problems
    }
}

pub async fn load_references<C: ConnectionTrait>(
    conn: &C,
    job: &SyncJob,
) -> Result<JobReferences, MirrorError> {
    let row = JobReferences::find_by_statement(statement(
        conn,
        r#"
        SELECT
            EXISTS (SELECT 1 FROM "user" WHERE id = $1 AND "deletedAt" IS NULL) AS source_user,
            EXISTS (SELECT 1 FROM "user" WHERE id = $2 AND "deletedAt" IS NULL) AS target_user,
            EXISTS (
                SELECT 1 FROM library
                WHERE id = $3 AND "ownerId" = $2 AND "deletedAt" IS NULL
            ) AS library,
            ($4::uuid IS NULL OR EXISTS (
                SELECT 1 FROM album
                WHERE id = $4 AND "ownerId" = $2 AND "deletedAt" IS NULL
            )) AS album
        "#,
        [
            job.source_user_id.into(),
            job.target_user_id.into(),
            job.target_library_id.into(),
            job.album_id.into(),
        ],
    ))
    .one(conn)
    .await
    .map_err(|e| map_db_err("checking job references", e))?;

    Ok(row.unwrap_or(JobReferences {
        source_user: false,
        target_user: false,
        library: false,
        album: false,
    }))
}

/// Fails on the first job whose users, library or album do not resolve.
pub async fn validate_job_references<C: ConnectionTrait>(
    conn: &C,
    jobs: &[SyncJob],
) -> Result<(), MirrorError> {
    for job in jobs {
        if job.source_user_id == job.target_user_id {
            return Err(MirrorError::JobReference {
                job: job.name.clone(),
                reason: "source and target user are the same".to_string(),
            });
        }
        let problems = load_references(conn, job).await?.problems(job);
        if !problems.is_empty() {
            return Err(MirrorError::JobReference {
                job: job.name.clone(),
                reason: problems.join("; "),
            });
        }
        info!(job = %job.name, "Job references verified");
    }
    Ok(())
}
