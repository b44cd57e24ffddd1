//! Completion-result ingestion.
//!
//! [`ResultIngestor::ingest`] takes one raw message from the results queue
//! through decode, job lookup, artifact write and the job completion.
//! Anything wrong with the message itself is a [`DropReason`]: the message
//! is logged and acknowledged. Failures of the stores are an
//! [`IngestError`]: nothing has been committed and the message should go
//! back to the queue.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use territorium_core::artifact::{
    artifact_name, sanitize_filename, ArtifactError, ArtifactRef, ArtifactStore,
};
use territorium_core::envelope::{decode_envelope, EnvelopeError};
use territorium_core::types::Timestamp;
use territorium_db::models::map_result::MapResult;
use territorium_db::store::{CompletionOutcome, JobStore, StoreError};

/// Why a message was discarded without storing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Not a JSON object.
    MalformedEnvelope,
    /// A required field is missing or unusable.
    IncompleteEnvelope,
    /// No job with the envelope's identifier exists.
    UnknownJob,
    /// The job already has a result.
    AlreadyCompleted,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedEnvelope => "malformed_envelope",
            Self::IncompleteEnvelope => "incomplete_envelope",
            Self::UnknownJob => "unknown_job",
            Self::AlreadyCompleted => "already_completed",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The artifact was written and the job moved to `COMPLETED`.
    Stored {
        job_id: String,
        result_id: Uuid,
        artifact: ArtifactRef,
    },
    Dropped {
        reason: DropReason,
        /// Present once the envelope decoded far enough to name a job.
        job_id: Option<String>,
    },
}

/// A persistence failure. The job is left `PENDING`.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Artifact write failed for job {job_id}: {source}")]
    Artifact {
        job_id: String,
        #[source]
        source: ArtifactError,
    },

    #[error("Job store failure for job {job_id}: {source}")]
    Store {
        job_id: String,
        #[source]
        source: StoreError,
    },
}

impl IngestError {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Artifact { job_id, .. } | Self::Store { job_id, .. } => job_id,
        }
    }
}

/// What to do with the broker message after ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
}

impl Disposition {
    pub fn for_result(result: &Result<IngestOutcome, IngestError>) -> Self {
        match result {
            Ok(_) => Self::Ack,
            Err(_) => Self::Requeue,
        }
    }
}

#[derive(Clone)]
pub struct ResultIngestor {
    jobs: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl ResultIngestor {
    pub fn new(jobs: Arc<dyn JobStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { jobs, artifacts }
    }

    pub async fn ingest(&self, body: &[u8]) -> Result<IngestOutcome, IngestError> {
        self.ingest_at(body, Utc::now()).await
    }

    /// Ingest one message, stamping the result and the job completion with
    /// `now`.
    pub async fn ingest_at(
        &self,
        body: &[u8],
        now: Timestamp,
    ) -> Result<IngestOutcome, IngestError> {
        let envelope = match decode_envelope(body) {
            Ok(envelope) => envelope,
            Err(EnvelopeError::Malformed(detail)) => {
                tracing::warn!(bytes = body.len(), %detail, "Dropping malformed result message");
                return Ok(dropped(DropReason::MalformedEnvelope, None));
            }
            Err(EnvelopeError::Incomplete { missing }) => {
                tracing::warn!(missing, "Dropping incomplete result message");
                return Ok(dropped(DropReason::IncompleteEnvelope, None));
            }
        };
        let job_id = envelope.job_id;

        let job = match self.jobs.get_job(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job_id, "Dropping result for unknown job");
                return Ok(dropped(DropReason::UnknownJob, Some(job_id)));
            }
            Err(source) => return Err(IngestError::Store { job_id, source }),
        };

        if job.is_completed() {
            tracing::info!(job_id, "Dropping duplicate result for completed job");
            return Ok(dropped(DropReason::AlreadyCompleted, Some(job_id)));
        }

        let (filename, name) = match sanitize_filename(&envelope.filename)
            .zip(artifact_name(&job_id, &envelope.filename).ok())
        {
            Some(pair) => pair,
            None => {
                tracing::warn!(
                    job_id,
                    filename = %envelope.filename,
                    "Dropping result with unusable filename",
                );
                return Ok(dropped(DropReason::IncompleteEnvelope, Some(job_id)));
            }
        };

        let artifact = match self.artifacts.put(&name, &envelope.payload).await {
            Ok(artifact) => artifact,
            // The name comes from the message, so retrying cannot help.
            Err(ArtifactError::InvalidReference(name)) => {
                tracing::warn!(job_id, name, "Dropping result the artifact store cannot name");
                return Ok(dropped(DropReason::IncompleteEnvelope, Some(job_id)));
            }
            Err(source) => return Err(IngestError::Artifact { job_id, source }),
        };

        let result = MapResult::new(Uuid::new_v4(), &job.guid, &artifact, filename, now);
        match self.jobs.complete_job(&job, &result, now).await {
            Ok(CompletionOutcome::Completed) => {
                tracing::info!(
                    job_id,
                    result_id = %result.guid,
                    artifact = %artifact,
                    bytes = envelope.payload.len(),
                    "Stored render result",
                );
                Ok(IngestOutcome::Stored {
                    job_id,
                    result_id: result.guid,
                    artifact,
                })
            }
            Ok(CompletionOutcome::AlreadyCompleted) => {
                tracing::info!(job_id, "Job completed concurrently, dropping result");
                Ok(dropped(DropReason::AlreadyCompleted, Some(job_id)))
            }
            Err(source) => Err(IngestError::Store { job_id, source }),
        }
    }
}

fn dropped(reason: DropReason, job_id: Option<String>) -> IngestOutcome {
    IngestOutcome::Dropped { reason, job_id }
}
