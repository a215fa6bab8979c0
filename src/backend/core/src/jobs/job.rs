//! Job records and their lifecycle.
//!
//! - **JobId**: process-unique identifier generated at submission
//! - **JobState**: `waiting → active → {completed | failed}`; terminal states are absorbing
//! - **Job**: the canonical record owned by the [`JobStore`](super::store::JobStore)
//! - **JobStatusView**: read-only projection returned by `get_status`
//!
//! Transition methods on [`Job`] refuse illegal moves instead of panicking, so
//! the store can apply them inside an atomic update and report what happened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
///
/// Random v4 UUIDs stay unique no matter how many jobs are created within the
/// same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submitted, waiting for a free worker slot
    Waiting,
    /// A worker is running the handler (possibly between retry attempts)
    Active,
    /// The handler returned a result
    Completed,
    /// The handler failed on every attempt, or no handler was registered
    Failed,
}

impl JobState {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check if `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Active)
                | (Self::Active, Self::Completed)
                | (Self::Active, Self::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid job transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// The unit of trackable work.
///
/// Values handed out by the store are snapshots; mutating one has no effect on
/// the canonical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,
    /// Current lifecycle state
    pub state: JobState,
    /// Handler routing key within the queue
    pub task_type: String,
    /// Queue (worker pool) the job runs on
    pub queue_name: String,
    /// Opaque data handed to the handler
    pub payload: serde_json::Value,
    /// Last reported progress, 0-100
    pub progress: u8,
    /// Handler invocations started so far
    pub attempts: u32,
    /// Invocations allowed before the job fails
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Handler result, set only on `completed`
    pub result: Option<serde_json::Value>,
    /// Failure description, set only on `failed`
    pub error: Option<String>,
}

impl Job {
    /// Create a new waiting job.
    pub fn new(
        task_type: impl Into<String>,
        queue_name: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: JobId::new(),
            state: JobState::Waiting,
            task_type: task_type.into(),
            queue_name: queue_name.into(),
            payload,
            progress: 0,
            attempts: 0,
            max_attempts,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn transition(&mut self, to: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Mark as active.
    pub fn mark_active(&mut self) -> Result<(), InvalidTransition> {
        self.transition(JobState::Active)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record the start of a handler invocation.
    pub fn begin_attempt(&mut self) -> u32 {
        if self.state == JobState::Active {
            self.attempts += 1;
        }
        self.attempts
    }

    /// Apply a progress report.
    ///
    /// Values are clamped to 100 and progress never moves backwards, so an
    /// attempt restarted after a retry keeps the highest value seen. Reports
    /// outside the `active` state are ignored. Returns whether the stored
    /// value changed.
    pub fn set_progress(&mut self, percent: u8) -> bool {
        if self.state != JobState::Active {
            return false;
        }
        let percent = percent.min(100);
        if percent <= self.progress {
            return false;
        }
        self.progress = percent;
        true
    }

    /// Mark as completed.
    pub fn mark_completed(&mut self, result: serde_json::Value) -> Result<(), InvalidTransition> {
        self.transition(JobState::Completed)?;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
        Ok(())
    }

    /// Mark as failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(JobState::Failed)?;
        self.failed_at = Some(Utc::now());
        self.error = Some(error.into());
        Ok(())
    }

    /// Time between start and the terminal transition.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let end = self.completed_at.or(self.failed_at)?;
        Some(end - self.started_at?)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Status View
// ═══════════════════════════════════════════════════════════════════════════════

/// Read-only projection of a job for status surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub state: JobState,
    pub queue_name: String,
    pub task_type: String,
    pub progress: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    /// Name of the uploaded file the records came from, if the payload carries one
    pub file_name: Option<String>,
    /// Number of records in the payload, if it carries a `records` array
    pub total_records: Option<usize>,
    pub is_completed: bool,
    pub is_failed: bool,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            state: job.state,
            queue_name: job.queue_name.clone(),
            task_type: job.task_type.clone(),
            progress: job.progress,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            failed_at: job.failed_at,
            error: job.error.clone(),
            result: job.result.clone(),
            file_name: job
                .payload
                .get("fileName")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            total_records: job
                .payload
                .get("records")
                .and_then(|v| v.as_array())
                .map(Vec::len),
            is_completed: job.state == JobState::Completed,
            is_failed: job.state == JobState::Failed,
        }
    }
}

impl From<Job> for JobStatusView {
    fn from(job: Job) -> Self {
        Self::from(&job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn waiting_job() -> Job {
        Job::new("process-users", "user-processing", json!({"records": [1, 2, 3]}), 3)
    }

    #[test]
    fn test_job_id_unique_and_parses() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);

        let parsed: JobId = id1.to_string().parse().unwrap();
        assert_eq!(parsed, id1);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_job_state_transitions() {
        assert!(JobState::Waiting.can_transition_to(JobState::Active));
        assert!(JobState::Active.can_transition_to(JobState::Completed));
        assert!(JobState::Active.can_transition_to(JobState::Failed));
        assert!(!JobState::Waiting.can_transition_to(JobState::Completed));
        assert!(!JobState::Completed.can_transition_to(JobState::Failed));
        assert!(!JobState::Failed.can_transition_to(JobState::Active));

        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Active.is_terminal());
    }

    #[test]
    fn test_new_job_is_waiting() {
        let job = waiting_job();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.progress, 0);
        assert!(job.result.is_none());
        assert!(job.error.is_none());
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_lifecycle_completed() {
        let mut job = waiting_job();
        job.mark_active().unwrap();
        assert_eq!(job.begin_attempt(), 1);
        assert!(job.set_progress(40));
        job.mark_completed(json!({"processed": 3})).unwrap();

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, 40);
        assert!(job.completed_at.is_some());
        assert!(job.error.is_none());
        assert!(job.duration().is_some());
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        let mut job = waiting_job();
        job.mark_active().unwrap();
        job.mark_failed("boom").unwrap();

        let err = job.mark_completed(json!(null)).unwrap_err();
        assert_eq!(err.from, JobState::Failed);
        assert_eq!(err.to, JobState::Completed);
        assert!(job.mark_active().is_err());
        assert!(!job.set_progress(90));
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.result.is_none());
    }

    #[test]
    fn test_progress_is_monotonic_and_clamped() {
        let mut job = waiting_job();
        assert!(!job.set_progress(10), "waiting jobs ignore progress");

        job.mark_active().unwrap();
        assert!(job.set_progress(50));
        assert!(!job.set_progress(20));
        assert_eq!(job.progress, 50);
        assert!(job.set_progress(250));
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_status_view_derived_fields() {
        let mut job = Job::new(
            "process-users",
            "user-processing",
            json!({"fileName": "users.csv", "records": [{"email": "a@x"}, {"email": "b@x"}]}),
            3,
        );
        let view = JobStatusView::from(&job);
        assert_eq!(view.file_name.as_deref(), Some("users.csv"));
        assert_eq!(view.total_records, Some(2));
        assert!(!view.is_completed);
        assert!(!view.is_failed);

        job.mark_active().unwrap();
        job.mark_completed(json!({})).unwrap();
        let view = JobStatusView::from(job);
        assert!(view.is_completed);
        assert!(!view.is_failed);
    }

    #[test]
    fn test_status_view_without_records() {
        let job = Job::new("t", "q", json!("opaque"), 1);
        let view = JobStatusView::from(&job);
        assert!(view.file_name.is_none());
        assert!(view.total_records.is_none());
    }
}
