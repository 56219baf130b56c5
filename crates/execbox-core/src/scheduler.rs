//! Fixed-size worker pool draining the intake queue.
//!
//! Each worker owns at most one sandbox at a time, so the pool size is the
//! concurrency bound. A worker claims a job before running it; a failed claim
//! means the job was cancelled while queued and is skipped. Whatever the
//! sandbox reports, including its own failure or a panic, ends up as the job's
//! terminal state.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::{ExecError, SandboxError};
use crate::executors::{ResourceLimits, RunOutcome, Sandbox};
use crate::jobs::{Failure, FailureKind, JobId, JobQueue, JobState, JobStore, RunResult};

struct WorkerContext {
    store: Arc<JobStore>,
    queue: Arc<JobQueue>,
    sandbox: Arc<dyn Sandbox>,
    limits: ResourceLimits,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawn `size` workers on the current runtime.
    pub fn start(
        size: usize,
        store: Arc<JobStore>,
        queue: Arc<JobQueue>,
        sandbox: Arc<dyn Sandbox>,
        limits: ResourceLimits,
    ) -> Self {
        check_memory_budget(size, limits.memory_mb);

        let context = Arc::new(WorkerContext {
            store,
            queue,
            sandbox,
            limits,
        });
        let shutdown = CancellationToken::new();
        let handles = (0..size)
            .map(|worker_id| {
                tokio::spawn(worker_loop(worker_id, context.clone(), shutdown.clone()))
            })
            .collect();

        log::info!(
            "Started {} workers on the {} sandbox",
            size,
            context.sandbox.name()
        );
        Self { handles, shutdown }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop pulling new jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                log::error!("Worker task ended abnormally: {}", e);
            }
        }
        log::info!("Worker pool stopped");
    }
}

async fn worker_loop(worker_id: usize, context: Arc<WorkerContext>, shutdown: CancellationToken) {
    loop {
        let job_id = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job_id = context.queue.pop() => job_id,
        };
        context.process(worker_id, job_id).await;
    }
    log::debug!("Worker {} exiting", worker_id);
}

impl WorkerContext {
    async fn process(&self, worker_id: usize, job_id: JobId) {
        let job = match self.store.claim(&job_id) {
            Ok(job) => job,
            Err(ExecError::InvalidTransition { from, .. }) => {
                log::debug!("Worker {} skipping job {} in state {}", worker_id, job_id, from);
                return;
            }
            Err(ExecError::NotFound(_)) => {
                log::debug!("Worker {} skipping evicted job {}", worker_id, job_id);
                return;
            }
            Err(e) => {
                log::error!("Worker {} could not claim job {}: {}", worker_id, job_id, e);
                return;
            }
        };
        log::info!(
            "Worker {} started job {} ({})",
            worker_id,
            job_id,
            job.language
        );

        // Run on its own task so a panicking backend cannot take the worker down
        let sandbox = self.sandbox.clone();
        let limits = self.limits.clone();
        let run = tokio::spawn(async move { sandbox.run(job.language, &job.code, &limits).await });
        let outcome = match run.await {
            Ok(outcome) => outcome,
            Err(e) => Err(SandboxError::Spawn(format!("sandbox task failed: {}", e))),
        };

        let (state, result) = classify(outcome, &self.limits);
        match state {
            JobState::TimedOut => log::warn!("Job {} timed out", job_id),
            JobState::Failed => match result.failure.as_ref().map(|f| f.kind) {
                Some(FailureKind::Infrastructure) => {
                    log::error!("Job {} failed in the sandbox runtime: {}", job_id, result.error_text)
                }
                Some(FailureKind::ResourceLimit) => {
                    log::warn!("Job {} hit the memory limit", job_id)
                }
                _ => {}
            },
            _ => {}
        }

        match self.store.complete(&job_id, state, result) {
            Ok(job) => log::info!(
                "Worker {} finished job {}: {} (exit code {:?})",
                worker_id,
                job_id,
                job.state,
                job.exit_code
            ),
            Err(e) => log::error!("Worker {} could not record result of job {}: {}", worker_id, job_id, e),
        }
    }
}

/// Map a sandbox outcome to the job's terminal state and result.
pub fn classify(outcome: Result<RunOutcome, SandboxError>, limits: &ResourceLimits) -> (JobState, RunResult) {
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            let message = e.to_string();
            return (
                JobState::Failed,
                RunResult {
                    output: String::new(),
                    error_text: with_marker("", &format!("Sandbox error: {}", message)),
                    exit_code: None,
                    failure: Some(Failure {
                        kind: FailureKind::Infrastructure,
                        message,
                    }),
                },
            );
        }
    };

    let failure = if outcome.timed_out {
        Some(Failure {
            kind: FailureKind::Timeout,
            message: format!(
                "Code execution timed out ({} seconds limit)",
                limits.timeout.as_secs()
            ),
        })
    } else if outcome.memory_exceeded {
        Some(Failure {
            kind: FailureKind::ResourceLimit,
            message: format!("Memory limit of {} MB exceeded", limits.memory_mb),
        })
    } else if outcome.exit_code == Some(0) {
        None
    } else {
        Some(Failure {
            kind: FailureKind::Execution,
            message: match outcome.exit_code {
                Some(code) => format!("Process exited with code {}", code),
                None => "Process exited without a status".to_string(),
            },
        })
    };

    let state = match failure.as_ref().map(|f| f.kind) {
        None => JobState::Succeeded,
        Some(FailureKind::Timeout) => JobState::TimedOut,
        Some(_) => JobState::Failed,
    };
    let error_text = match &failure {
        Some(failure) => with_marker(&outcome.stderr, &failure.message),
        None => outcome.stderr,
    };

    (
        state,
        RunResult {
            output: outcome.stdout,
            error_text,
            exit_code: outcome.exit_code,
            failure,
        },
    )
}

fn with_marker(stderr: &str, marker: &str) -> String {
    if stderr.is_empty() {
        format!("{}\n", marker)
    } else if stderr.ends_with('\n') {
        format!("{}{}\n", stderr, marker)
    } else {
        format!("{}\n{}\n", stderr, marker)
    }
}

/// Total host memory in MB, from `/proc/meminfo`.
fn host_memory_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_total_mb(&meminfo)
}

fn parse_mem_total_mb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

fn check_memory_budget(workers: usize, memory_mb: u64) {
    let Some(host_mb) = host_memory_mb() else {
        log::debug!("Host memory unknown; skipping worker sizing check");
        return;
    };
    let budget = workers as u64 * memory_mb;
    if budget > host_mb {
        log::warn!(
            "{} workers x {} MB = {} MB exceeds host memory of {} MB; reduce workers or memory_mb",
            workers,
            memory_mb,
            budget,
            host_mb
        );
    }
}
