//! In-process ingestion counters.
//!
//! Counters are plain atomics shared between the consumer and the retention
//! sweeper. The consumer logs a [`IngestMetricsSnapshot`] periodically and
//! on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::ingest::{DropReason, IngestOutcome};

#[derive(Debug, Default)]
pub struct IngestMetrics {
    stored: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_incomplete: AtomicU64,
    dropped_unknown_job: AtomicU64,
    dropped_already_completed: AtomicU64,
    persistence_failures: AtomicU64,
    panics: AtomicU64,
    reconnects: AtomicU64,
    results_swept: AtomicU64,
}

/// Point-in-time copy of [`IngestMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestMetricsSnapshot {
    pub stored: u64,
    pub dropped_malformed: u64,
    pub dropped_incomplete: u64,
    pub dropped_unknown_job: u64,
    pub dropped_already_completed: u64,
    pub persistence_failures: u64,
    pub panics: u64,
    pub reconnects: u64,
    pub results_swept: u64,
}

impl IngestMetricsSnapshot {
    pub fn dropped(&self) -> u64 {
        self.dropped_malformed
            + self.dropped_incomplete
            + self.dropped_unknown_job
            + self.dropped_already_completed
    }
}

impl IngestMetrics {
    pub fn record_outcome(&self, outcome: &IngestOutcome) {
        let counter = match outcome {
            IngestOutcome::Stored { .. } => &self.stored,
            IngestOutcome::Dropped { reason, .. } => match reason {
                DropReason::MalformedEnvelope => &self.dropped_malformed,
                DropReason::IncompleteEnvelope => &self.dropped_incomplete,
                DropReason::UnknownJob => &self.dropped_unknown_job,
                DropReason::AlreadyCompleted => &self.dropped_already_completed,
            },
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_swept(&self, results: u64) {
        self.results_swept.fetch_add(results, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestMetricsSnapshot {
        IngestMetricsSnapshot {
            stored: self.stored.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_incomplete: self.dropped_incomplete.load(Ordering::Relaxed),
            dropped_unknown_job: self.dropped_unknown_job.load(Ordering::Relaxed),
            dropped_already_completed: self.dropped_already_completed.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            results_swept: self.results_swept.load(Ordering::Relaxed),
        }
    }

    /// Emit the current counters as one structured log line.
    pub fn log_snapshot(&self) {
        let s = self.snapshot();
        tracing::info!(
            stored = s.stored,
            dropped = s.dropped(),
            dropped_malformed = s.dropped_malformed,
            dropped_incomplete = s.dropped_incomplete,
            dropped_unknown_job = s.dropped_unknown_job,
            dropped_already_completed = s.dropped_already_completed,
            persistence_failures = s.persistence_failures,
            panics = s.panics,
            reconnects = s.reconnects,
            results_swept = s.results_swept,
            "Ingestion metrics",
        );
    }
}

#[cfg(test)]
mod tests {
    use territorium_core::artifact::ArtifactRef;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn counts_outcomes_by_kind() {
        let metrics = IngestMetrics::default();
        metrics.record_outcome(&IngestOutcome::Stored {
            job_id: "J1".into(),
            result_id: Uuid::new_v4(),
            artifact: ArtifactRef::new("maps/J1/out.png"),
        });
        metrics.record_outcome(&IngestOutcome::Dropped {
            reason: DropReason::UnknownJob,
            job_id: Some("J9".into()),
        });
        metrics.record_outcome(&IngestOutcome::Dropped {
            reason: DropReason::MalformedEnvelope,
            job_id: None,
        });
        metrics.record_persistence_failure();
        metrics.record_swept(4);

        let s = metrics.snapshot();
        assert_eq!(s.stored, 1);
        assert_eq!(s.dropped_unknown_job, 1);
        assert_eq!(s.dropped_malformed, 1);
        assert_eq!(s.dropped(), 2);
        assert_eq!(s.persistence_failures, 1);
        assert_eq!(s.results_swept, 4);
        assert_eq!(s.panics, 0);
    }

    #[test]
    fn snapshot_serializes_flat() {
        let metrics = IngestMetrics::default();
        metrics.record_reconnect();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["reconnects"], 1);
        assert_eq!(json["stored"], 0);
    }
}
