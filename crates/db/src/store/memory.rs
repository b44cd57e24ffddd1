//! In-process [`JobStore`] used by tests and local dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use territorium_core::types::Timestamp;

use super::{CompletionOutcome, JobStore, StoreError};
use crate::models::map_result::MapResult;
use crate::models::render_job::RenderJob;

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<String, RenderJob>,
    results: Vec<MapResult>,
}

/// Mutex-guarded job store with the same completion semantics as
/// [`super::PgJobStore`].
///
/// `set_failing(true)` makes every write fail with
/// [`StoreError::Unavailable`] without mutating anything.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    tables: Mutex<Tables>,
    failing: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job, as the intake service would.
    pub fn insert_job(&self, job: RenderJob) {
        self.lock().jobs.insert(job.guid.clone(), job);
    }

    pub fn job(&self, guid: &str) -> Option<RenderJob> {
        self.lock().jobs.get(guid).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn results_for(&self, guid: &str) -> Vec<MapResult> {
        self.lock()
            .results
            .iter()
            .filter(|r| r.job_guid == guid)
            .cloned()
            .collect()
    }

    pub fn result_count(&self) -> usize {
        self.lock().results.len()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get_job(&self, guid: &str) -> Result<Option<RenderJob>, StoreError> {
        Ok(self.job(guid))
    }

    async fn save_job(&self, job: &RenderJob) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.lock();
        let mut next = job.clone();
        if let Some(existing) = tables.jobs.get(&job.guid) {
            next.completed_at = existing.completed_at.or(job.completed_at);
        }
        tables.jobs.insert(next.guid.clone(), next);
        Ok(())
    }

    async fn create_result(&self, result: &MapResult) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.lock();
        if !tables.jobs.contains_key(&result.job_guid) {
            return Err(StoreError::Unavailable(format!(
                "result references unknown job '{}'",
                result.job_guid
            )));
        }
        tables.results.push(result.clone());
        Ok(())
    }

    async fn expired_results(&self, cutoff: Timestamp) -> Result<Vec<MapResult>, StoreError> {
        Ok(self
            .lock()
            .results
            .iter()
            .filter(|r| r.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn delete_results_older_than(&self, cutoff: Timestamp) -> Result<u64, StoreError> {
        self.check_writable()?;
        let mut tables = self.lock();
        let before = tables.results.len();
        tables.results.retain(|r| r.created_at >= cutoff);
        Ok((before - tables.results.len()) as u64)
    }

    async fn complete_job(
        &self,
        job: &RenderJob,
        result: &MapResult,
        completed_at: Timestamp,
    ) -> Result<CompletionOutcome, StoreError> {
        self.check_writable()?;
        let mut tables = self.lock();

        match tables.jobs.get_mut(&job.guid) {
            Some(stored) if stored.completed_at.is_none() => {
                stored.completed_at = Some(completed_at);
            }
            _ => return Ok(CompletionOutcome::AlreadyCompleted),
        }
        tables.results.push(result.clone());

        Ok(CompletionOutcome::Completed)
    }
}
