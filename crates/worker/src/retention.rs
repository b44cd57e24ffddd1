//! Periodic purge of expired map results.
//!
//! Results older than the retention window are deleted from the job store
//! and their artifacts removed. Jobs are never touched: a completed job
//! whose result has been swept stays `COMPLETED`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use territorium_core::artifact::ArtifactStore;
use territorium_core::retention::{retention_cutoff, RETENTION_DAYS};
use territorium_core::types::Timestamp;
use territorium_db::store::{JobStore, StoreError};

use crate::metrics::IngestMetrics;

/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Result rows deleted.
    pub results_deleted: u64,
    /// Artifacts removed from the artifact store.
    pub artifacts_deleted: u64,
    /// Artifacts whose removal failed and were left behind.
    pub artifacts_failed: u64,
}

pub struct RetentionSweeper {
    jobs: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
    metrics: Option<Arc<IngestMetrics>>,
}

impl RetentionSweeper {
    pub fn new(jobs: Arc<dyn JobStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            jobs,
            artifacts,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<IngestMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        self.sweep_at(Utc::now()).await
    }

    /// Delete every result created before `now` minus the retention window.
    ///
    /// Rows go first; artifact removal is best effort, so a failed delete
    /// leaves an orphaned file rather than a row pointing at nothing.
    pub async fn sweep_at(&self, now: Timestamp) -> Result<SweepReport, StoreError> {
        let cutoff = retention_cutoff(now);
        let expired = self.jobs.expired_results(cutoff).await?;
        let results_deleted = self.jobs.delete_results_older_than(cutoff).await?;

        let mut report = SweepReport {
            results_deleted,
            ..SweepReport::default()
        };

        for result in &expired {
            let artifact = result.artifact_ref();
            match self.artifacts.delete(&artifact).await {
                Ok(()) => report.artifacts_deleted += 1,
                Err(e) => {
                    report.artifacts_failed += 1;
                    tracing::warn!(
                        result_id = %result.guid,
                        artifact = %artifact,
                        error = %e,
                        "Retention: failed to delete artifact",
                    );
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_swept(results_deleted);
        }
        Ok(report)
    }

    /// Run the sweep every `interval` until `cancel` is triggered.
    pub async fn run_periodic(self, interval: Duration, cancel: CancellationToken) {
        tracing::info!(
            retention_days = RETENTION_DAYS,
            interval_secs = interval.as_secs(),
            "Result retention job started"
        );

        let mut ticker = crate::skipping_interval(interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Result retention job stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) if report.results_deleted > 0 => {
                            tracing::info!(
                                deleted = report.results_deleted,
                                artifacts_deleted = report.artifacts_deleted,
                                artifacts_failed = report.artifacts_failed,
                                "Result retention: purged expired results"
                            );
                        }
                        Ok(_) => {
                            tracing::debug!("Result retention: nothing to purge");
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Result retention: sweep failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use territorium_core::artifact::{ArtifactRef, MemoryArtifactStore};
    use territorium_db::models::map_result::MapResult;
    use territorium_db::models::render_job::RenderJob;
    use territorium_db::store::MemoryJobStore;
    use uuid::Uuid;

    use super::*;

    async fn seed(
        jobs: &MemoryJobStore,
        artifacts: &MemoryArtifactStore,
        guid: &str,
        created_at: Timestamp,
    ) -> ArtifactRef {
        jobs.insert_job(RenderJob::pending(guid, 1, created_at));
        let name = format!("maps/{guid}/out.png");
        let artifact = artifacts.put(&name, b"png").await.unwrap();
        let result = MapResult::new(Uuid::new_v4(), guid, &artifact, "out.png", created_at);
        jobs.complete_job(&jobs.job(guid).unwrap(), &result, created_at)
            .await
            .unwrap();
        artifact
    }

    #[tokio::test]
    async fn sweeps_only_expired_results() {
        let jobs = Arc::new(MemoryJobStore::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let now = Utc::now();

        seed(&jobs, &artifacts, "old", now - ChronoDuration::days(8)).await;
        seed(&jobs, &artifacts, "recent", now - ChronoDuration::days(6)).await;

        let metrics = Arc::new(IngestMetrics::default());
        let sweeper =
            RetentionSweeper::new(jobs.clone(), artifacts.clone()).with_metrics(metrics.clone());
        let report = sweeper.sweep_at(now).await.unwrap();

        assert_eq!(report.results_deleted, 1);
        assert_eq!(report.artifacts_deleted, 1);
        assert!(jobs.results_for("old").is_empty());
        assert_eq!(jobs.results_for("recent").len(), 1);
        assert!(!artifacts.contains("maps/old/out.png"));
        assert!(artifacts.contains("maps/recent/out.png"));
        assert_eq!(metrics.snapshot().results_swept, 1);

        // The job itself survives and stays completed.
        assert!(jobs.job("old").unwrap().is_completed());
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let jobs = Arc::new(MemoryJobStore::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let now = Utc::now();
        seed(&jobs, &artifacts, "old", now - ChronoDuration::days(30)).await;

        let sweeper = RetentionSweeper::new(jobs.clone(), artifacts.clone());
        assert_eq!(sweeper.sweep_at(now).await.unwrap().results_deleted, 1);
        assert_eq!(sweeper.sweep_at(now).await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn store_failure_is_reported() {
        let jobs = Arc::new(MemoryJobStore::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let now = Utc::now();
        seed(&jobs, &artifacts, "old", now - ChronoDuration::days(30)).await;
        jobs.set_failing(true);

        let sweeper = RetentionSweeper::new(jobs.clone(), artifacts.clone());
        assert!(sweeper.sweep_at(now).await.is_err());
        assert!(artifacts.contains("maps/old/out.png"));
    }

    #[tokio::test]
    async fn periodic_run_stops_on_cancel() {
        let jobs = Arc::new(MemoryJobStore::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            RetentionSweeper::new(jobs, artifacts).run_periodic(Duration::from_secs(3600), cancel.clone()),
        );
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper stops promptly")
            .unwrap();
    }
}
