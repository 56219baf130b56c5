//! Error types for job orchestration and sandboxed execution
//!
//! Errors are split by where they surface. `ExecError` is what gateway callers
//! see: bad input, unknown jobs, results that are not ready yet. `SandboxError`
//! covers failures to create or drive an isolated environment; those never
//! reach a caller directly and are folded into the job's terminal state by the
//! worker that owns the job.

use thiserror::Error;
use uuid::Uuid;

use crate::jobs::JobState;

#[derive(Error, Debug, Clone)]
pub enum ExecError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Job {0} not found")]
    NotFound(Uuid),
    #[error("Job {job_id} is not finished yet (state: {state})")]
    NotReady { job_id: Uuid, state: JobState },
    #[error("Timed out waiting for job {job_id}; it keeps running and its result can be fetched later")]
    WaitTimeout { job_id: Uuid },
    #[error("Job {job_id} cannot be cancelled in state {state}")]
    NotCancellable { job_id: Uuid, state: JobState },
    #[error("Illegal state transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> Self {
        ExecError::Io(err.to_string())
    }
}

// Failures of the isolation runtime itself, as opposed to failures of user code
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Bollard (Docker client) error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("I/O error during sandbox operation: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not prepare temporary workspace: {0}")]
    TempWorkspace(String),
    #[error("Could not start sandboxed process: {0}")]
    Spawn(String),
    #[error("Isolation runtime unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("Completion request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Completion provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Completion provider returned no suggestion")]
    Empty,
}
