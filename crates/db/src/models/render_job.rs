//! Render job entity.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use territorium_core::job_state::JobState;
use territorium_core::types::{DbId, JobGuid, Timestamp};

/// A row from the `render_jobs` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct RenderJob {
    pub guid: JobGuid,
    pub owner_id: DbId,
    pub submitted_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl RenderJob {
    /// A freshly submitted job in `PENDING` state.
    pub fn pending(guid: impl Into<JobGuid>, owner_id: DbId, submitted_at: Timestamp) -> Self {
        Self {
            guid: guid.into(),
            owner_id,
            submitted_at,
            completed_at: None,
        }
    }

    pub fn state(&self) -> JobState {
        JobState::from_completed_at(self.completed_at)
    }

    pub fn is_completed(&self) -> bool {
        self.state().is_terminal()
    }
}

/// DTO used by the intake service to register a job before publishing it.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRenderJob {
    pub guid: JobGuid,
    pub owner_id: DbId,
}
