//! Remote code execution: job intake, scheduling and sandboxed runs.
//!
//! Submitted code becomes a [`jobs::Job`] that moves through a fixed state
//! machine. The [`gateway::Gateway`] validates and enqueues, a fixed
//! [`scheduler::WorkerPool`] drains the queue into fresh sandboxes
//! ([`executors::Sandbox`]), and every outcome, including sandbox failures, is
//! recorded as the job's terminal state in the [`jobs::JobStore`].
//!
//! - **Sandbox backends**: Docker containers via bollard, or host process groups
//! - **Sync and async contracts**: block until done, or submit and poll
//! - **Completion proxy**: inline code suggestions from an external provider

pub mod completion;
pub mod config;
pub mod errors;
pub mod executors;
pub mod gateway;
pub mod jobs;
pub mod scheduler;
pub mod service;

pub use completion::{DisabledSuggestionProvider, HttpSuggestionProvider, SuggestionProvider};
pub use config::{ConfigLoader, ExecboxConfig, SandboxBackend};
pub use errors::{CompletionError, ExecError, SandboxError};
pub use executors::{Language, ResourceLimits, RunOutcome, Sandbox};
pub use gateway::{Gateway, GatewaySettings};
pub use jobs::{Failure, FailureKind, Job, JobId, JobResult, JobState};
pub use scheduler::WorkerPool;
pub use service::ExecutionService;
