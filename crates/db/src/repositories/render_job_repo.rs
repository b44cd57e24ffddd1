//! Repository for the `render_jobs` table.
//!
//! `completed_at` is write-once: every statement here either leaves it
//! alone or sets it only where it is still null.

use sqlx::{PgExecutor, PgPool};
use territorium_core::types::Timestamp;

use crate::models::render_job::{RenderJob, SubmitRenderJob};

/// Column list for `render_jobs` queries.
const COLUMNS: &str = "guid, owner_id, submitted_at, completed_at";

/// Default page size for pending-job listings.
const DEFAULT_LIMIT: i64 = 100;

/// Provides CRUD operations for render jobs.
pub struct RenderJobRepo;

impl RenderJobRepo {
    /// Register a new pending job.
    pub async fn submit(pool: &PgPool, input: &SubmitRenderJob) -> Result<RenderJob, sqlx::Error> {
        let query = format!(
            "INSERT INTO render_jobs (guid, owner_id) \
             VALUES ($1, $2) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, RenderJob>(&query)
            .bind(&input.guid)
            .bind(input.owner_id)
            .fetch_one(pool)
            .await
    }

    /// Find a job by its submitter-assigned identifier.
    pub async fn find_by_guid(pool: &PgPool, guid: &str) -> Result<Option<RenderJob>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM render_jobs WHERE guid = $1");
        sqlx::query_as::<_, RenderJob>(&query)
            .bind(guid)
            .fetch_optional(pool)
            .await
    }

    /// Insert or update a job.
    ///
    /// An existing completion timestamp is kept even if `job.completed_at`
    /// is null or different.
    pub async fn upsert(pool: &PgPool, job: &RenderJob) -> Result<RenderJob, sqlx::Error> {
        let query = format!(
            "INSERT INTO render_jobs (guid, owner_id, submitted_at, completed_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (guid) DO UPDATE \
             SET owner_id = EXCLUDED.owner_id, \
                 completed_at = COALESCE(render_jobs.completed_at, EXCLUDED.completed_at) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, RenderJob>(&query)
            .bind(&job.guid)
            .bind(job.owner_id)
            .bind(job.submitted_at)
            .bind(job.completed_at)
            .fetch_one(pool)
            .await
    }

    /// Compare-and-set the completion timestamp.
    ///
    /// Returns `true` if this call completed the job, `false` if it was
    /// already completed or does not exist. Accepts a pool or an open
    /// transaction.
    pub async fn mark_completed<'e>(
        executor: impl PgExecutor<'e>,
        guid: &str,
        completed_at: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE render_jobs SET completed_at = $2 \
             WHERE guid = $1 AND completed_at IS NULL",
        )
        .bind(guid)
        .bind(completed_at)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List jobs still waiting for a result, oldest first.
    pub async fn list_pending(pool: &PgPool, limit: Option<i64>) -> Result<Vec<RenderJob>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM render_jobs \
             WHERE completed_at IS NULL \
             ORDER BY submitted_at ASC \
             LIMIT $1"
        );
        sqlx::query_as::<_, RenderJob>(&query)
            .bind(limit.unwrap_or(DEFAULT_LIMIT))
            .fetch_all(pool)
            .await
    }
}
