//! PostgreSQL-backed [`JobStore`].

use async_trait::async_trait;
use sqlx::PgPool;
use territorium_core::types::Timestamp;

use super::{CompletionOutcome, JobStore, StoreError};
use crate::models::map_result::MapResult;
use crate::models::render_job::RenderJob;
use crate::repositories::{MapResultRepo, RenderJobRepo};

/// Job store over the `render_jobs` and `map_results` tables.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn get_job(&self, guid: &str) -> Result<Option<RenderJob>, StoreError> {
        Ok(RenderJobRepo::find_by_guid(&self.pool, guid).await?)
    }

    async fn save_job(&self, job: &RenderJob) -> Result<(), StoreError> {
        RenderJobRepo::upsert(&self.pool, job).await?;
        Ok(())
    }

    async fn create_result(&self, result: &MapResult) -> Result<(), StoreError> {
        MapResultRepo::create(&self.pool, result).await?;
        Ok(())
    }

    async fn expired_results(&self, cutoff: Timestamp) -> Result<Vec<MapResult>, StoreError> {
        Ok(MapResultRepo::list_older_than(&self.pool, cutoff).await?)
    }

    async fn delete_results_older_than(&self, cutoff: Timestamp) -> Result<u64, StoreError> {
        Ok(MapResultRepo::delete_older_than(&self.pool, cutoff).await?)
    }

    /// Completes the job and inserts the result in one transaction.
    ///
    /// The `UPDATE .. WHERE completed_at IS NULL` takes the row lock, so a
    /// competing consumer holding a duplicate delivery blocks until this
    /// commits and then sees zero affected rows.
    async fn complete_job(
        &self,
        job: &RenderJob,
        result: &MapResult,
        completed_at: Timestamp,
    ) -> Result<CompletionOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        if !RenderJobRepo::mark_completed(&mut *tx, &job.guid, completed_at).await? {
            tx.rollback().await?;
            tracing::debug!(job = %job.guid, "Job already completed by another delivery");
            return Ok(CompletionOutcome::AlreadyCompleted);
        }

        MapResultRepo::create(&mut *tx, result).await?;

        tx.commit().await?;
        Ok(CompletionOutcome::Completed)
    }
}
