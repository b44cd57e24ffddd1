//! Job store contract consumed by the result-ingestion worker.
//!
//! [`JobStore`] is the narrow surface the consumer and the retention
//! sweeper need: look up a job, persist a job, create a result, and purge
//! old results. [`JobStore::complete_job`] bundles the completion write so
//! backends that can do it atomically (see [`postgres::PgJobStore`]) close
//! the race between the "already completed?" check and the write.

use async_trait::async_trait;
use territorium_core::types::Timestamp;

use crate::models::map_result::MapResult;
use crate::models::render_job::RenderJob;

pub mod memory;
pub mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job store unavailable: {0}")]
    Unavailable(String),
}

/// Result of attempting to complete a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The result was recorded and the job moved to `COMPLETED`.
    Completed,
    /// Another delivery completed the job first; nothing was written.
    AlreadyCompleted,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Look up a job. `Ok(None)` means no job has that identifier.
    async fn get_job(&self, guid: &str) -> Result<Option<RenderJob>, StoreError>;

    /// Persist a job. A stored completion timestamp is never cleared.
    async fn save_job(&self, job: &RenderJob) -> Result<(), StoreError>;

    /// Persist a new result row.
    async fn create_result(&self, result: &MapResult) -> Result<(), StoreError>;

    /// Results created before `cutoff`, so their artifacts can be removed.
    async fn expired_results(&self, cutoff: Timestamp) -> Result<Vec<MapResult>, StoreError>;

    /// Delete results created before `cutoff`. Returns how many were removed.
    async fn delete_results_older_than(&self, cutoff: Timestamp) -> Result<u64, StoreError>;

    /// Record `result` and mark `job` completed at `completed_at`.
    ///
    /// The default writes the result first and the job second, so a
    /// failure between the two leaves the job pending and a redelivery
    /// repeats the whole step. Implementations should override this with
    /// an atomic compare-and-set when the backend allows it.
    async fn complete_job(
        &self,
        job: &RenderJob,
        result: &MapResult,
        completed_at: Timestamp,
    ) -> Result<CompletionOutcome, StoreError> {
        if job.is_completed() {
            return Ok(CompletionOutcome::AlreadyCompleted);
        }
        self.create_result(result).await?;

        let mut completed = job.clone();
        completed.completed_at = Some(completed_at);
        self.save_job(&completed).await?;

        Ok(CompletionOutcome::Completed)
    }
}
