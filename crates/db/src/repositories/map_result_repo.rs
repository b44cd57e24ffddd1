//! Repository for the `map_results` table.

use sqlx::{PgExecutor, PgPool};
use territorium_core::types::{DbId, Timestamp};
use uuid::Uuid;

use crate::models::map_result::MapResult;

/// Column list for `map_results` queries.
const COLUMNS: &str = "guid, job_guid, artifact, filename, created_at";

/// Provides query operations for map results.
pub struct MapResultRepo;

impl MapResultRepo {
    /// Insert a result row through a pool or an open transaction.
    pub async fn create<'e>(
        executor: impl PgExecutor<'e>,
        result: &MapResult,
    ) -> Result<MapResult, sqlx::Error> {
        let query = format!(
            "INSERT INTO map_results ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, MapResult>(&query)
            .bind(result.guid)
            .bind(&result.job_guid)
            .bind(&result.artifact)
            .bind(&result.filename)
            .bind(result.created_at)
            .fetch_one(executor)
            .await
    }

    pub async fn find_by_guid(pool: &PgPool, guid: Uuid) -> Result<Option<MapResult>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM map_results WHERE guid = $1");
        sqlx::query_as::<_, MapResult>(&query)
            .bind(guid)
            .fetch_optional(pool)
            .await
    }

    /// All results attached to one job, oldest first.
    pub async fn list_by_job(pool: &PgPool, job_guid: &str) -> Result<Vec<MapResult>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM map_results WHERE job_guid = $1 ORDER BY created_at ASC"
        );
        sqlx::query_as::<_, MapResult>(&query)
            .bind(job_guid)
            .fetch_all(pool)
            .await
    }

    /// Results of every job owned by `owner_id`, newest first.
    ///
    /// Backs the result listing served by the intake service.
    pub async fn list_by_owner(pool: &PgPool, owner_id: DbId) -> Result<Vec<MapResult>, sqlx::Error> {
        sqlx::query_as::<_, MapResult>(
            "SELECT r.guid, r.job_guid, r.artifact, r.filename, r.created_at \
             FROM map_results r \
             JOIN render_jobs j ON j.guid = r.job_guid \
             WHERE j.owner_id = $1 \
             ORDER BY r.created_at DESC",
        )
        .bind(owner_id)
        .fetch_all(pool)
        .await
    }

    /// Results created before `cutoff`.
    pub async fn list_older_than(pool: &PgPool, cutoff: Timestamp) -> Result<Vec<MapResult>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM map_results WHERE created_at < $1");
        sqlx::query_as::<_, MapResult>(&query)
            .bind(cutoff)
            .fetch_all(pool)
            .await
    }

    /// Delete results created before `cutoff`. Returns the number of rows removed.
    pub async fn delete_older_than(pool: &PgPool, cutoff: Timestamp) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM map_results WHERE created_at < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
