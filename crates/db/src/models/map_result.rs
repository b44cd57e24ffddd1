//! Map result entity: one stored artifact for a render job.

use serde::Serialize;
use sqlx::FromRow;
use territorium_core::artifact::ArtifactRef;
use territorium_core::types::{JobGuid, ResultGuid, Timestamp};

/// A row from the `map_results` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct MapResult {
    pub guid: ResultGuid,
    pub job_guid: JobGuid,
    /// Opaque artifact store reference.
    pub artifact: String,
    /// Display name offered to the downloading user.
    pub filename: String,
    pub created_at: Timestamp,
}

impl MapResult {
    pub fn new(
        guid: ResultGuid,
        job_guid: impl Into<JobGuid>,
        artifact: &ArtifactRef,
        filename: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            guid,
            job_guid: job_guid.into(),
            artifact: artifact.as_str().to_string(),
            filename: filename.into(),
            created_at,
        }
    }

    pub fn artifact_ref(&self) -> ArtifactRef {
        ArtifactRef::new(self.artifact.clone())
    }
}
