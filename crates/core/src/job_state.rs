//! Render job lifecycle.
//!
//! A job is `PENDING` while its completion timestamp is null and
//! `COMPLETED` once it is set. The only transition is
//! `PENDING -> COMPLETED`; there is no failure state, so a job whose worker
//! never answers stays pending.

use serde::Serialize;

use crate::types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Completed,
}

impl JobState {
    /// Derive the state from a job's completion timestamp.
    pub fn from_completed_at(completed_at: Option<Timestamp>) -> Self {
        match completed_at {
            Some(_) => Self::Completed,
            None => Self::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!((self, next), (Self::Pending, Self::Completed))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn null_completion_is_pending() {
        assert_eq!(JobState::from_completed_at(None), JobState::Pending);
    }

    #[test]
    fn set_completion_is_completed() {
        assert_eq!(
            JobState::from_completed_at(Some(Utc::now())),
            JobState::Completed
        );
    }

    #[test]
    fn only_pending_to_completed() {
        assert!(JobState::Pending.can_transition_to(JobState::Completed));
        assert!(!JobState::Completed.can_transition_to(JobState::Pending));
        assert!(!JobState::Completed.can_transition_to(JobState::Completed));
        assert!(!JobState::Pending.can_transition_to(JobState::Pending));
    }

    #[test]
    fn completed_is_terminal() {
        assert!(JobState::Completed.is_terminal());
        assert!(!JobState::Pending.is_terminal());
    }

    #[test]
    fn serializes_upper_case() {
        assert_eq!(
            serde_json::to_string(&JobState::Completed).unwrap(),
            "\"COMPLETED\""
        );
    }
}
