//! Job model: the unit of work and its lifecycle record.
//!
//! A job is created `Queued` by the gateway, claimed by exactly one worker
//! (`Running`) and finished by that worker in one of the terminal states.
//! Result fields are written once, together with the terminal transition.

pub mod queue;
pub mod store;

pub use queue::JobQueue;
pub use store::{JobStore, StateCounts};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::executors::Language;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::TimedOut | JobState::Cancelled
        )
    }

    /// The only edges of the job state machine.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Cancelled)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::TimedOut)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::TimedOut => write!(f, "timed_out"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a finished job did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// User code exited non-zero.
    Execution,
    /// Memory ceiling breached; the sandbox killed the process.
    ResourceLimit,
    /// Wall-clock deadline exceeded.
    Timeout,
    /// The sandbox could not be created or driven.
    Infrastructure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome written by the owning worker together with the terminal state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub output: String,
    pub error_text: String,
    pub exit_code: Option<i64>,
    pub failure: Option<Failure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub code: String,
    pub language: Language,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: String,
    pub error_text: String,
    pub exit_code: Option<i64>,
    pub failure: Option<Failure>,
}

impl Job {
    pub fn new(code: String, language: Language) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            language,
            state: JobState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            output: String::new(),
            error_text: String::new(),
            exit_code: None,
            failure: None,
        }
    }

    pub fn result(&self) -> JobResult {
        JobResult {
            job_id: self.id,
            state: self.state,
            output: self.output.clone(),
            error: self.error_text.clone(),
            success: self.state == JobState::Succeeded,
            exit_code: self.exit_code,
            failure: self.failure.clone(),
        }
    }
}

/// Caller-facing view of a terminal job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub state: JobState,
    pub output: String,
    pub error: String,
    pub success: bool,
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        let all = [
            JobState::Queued,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
            JobState::TimedOut,
            JobState::Cancelled,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {} must be illegal", from, to);
            }
        }
    }

    #[test]
    fn running_cannot_go_back_or_be_cancelled() {
        assert!(!JobState::Running.can_transition_to(JobState::Queued));
        assert!(!JobState::Running.can_transition_to(JobState::Cancelled));
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(!JobState::Queued.can_transition_to(JobState::Succeeded));
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&JobState::TimedOut).unwrap(), "\"timed_out\"");
        assert_eq!(JobState::TimedOut.to_string(), "timed_out");
    }

    #[test]
    fn fresh_job_has_no_result() {
        let job = Job::new("print(1)".to_string(), Language::Python);
        assert_eq!(job.state, JobState::Queued);
        assert!(job.output.is_empty());
        assert!(job.exit_code.is_none());
        assert!(job.started_at.is_none());
        assert!(!job.result().success);
    }
}
