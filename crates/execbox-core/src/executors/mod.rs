//! Sandboxed execution environments for untrusted code.
//!
//! Every invocation gets a fresh, exclusive environment: a per-run temporary
//! workspace holding the source file plus either a locked-down container
//! (Docker) or a host process group (local). Both are torn down on every exit
//! path. Memory, CPU, process-count and network limits come from
//! [`ResourceLimits`]; the wall-clock deadline is enforced by the runner itself.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::SandboxError;

pub mod docker;
pub mod language;
pub mod local;
mod output;

pub use docker::DockerSandbox;
pub use language::{Language, Recipe};
pub use local::LocalSandbox;

/// Exit code reported for a process killed at its deadline.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub timeout: Duration,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: i64,
    pub network_disabled: bool,
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            memory_mb: 128,
            cpus: 0.5,
            pids_limit: 64,
            network_disabled: true,
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// What came back from one sandboxed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub memory_exceeded: bool,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run `code` to completion or to the deadline in `limits`.
    ///
    /// An `Err` means the environment itself could not be created or driven;
    /// failures of the user's program are reported through [`RunOutcome`].
    async fn run(
        &self,
        language: Language,
        code: &str,
        limits: &ResourceLimits,
    ) -> Result<RunOutcome, SandboxError>;

    /// Short backend name used in logs.
    fn name(&self) -> &'static str;
}
