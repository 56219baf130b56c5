//! Concurrency-safe keyed store of job records.
//!
//! The outer map lock is only held to look up or insert an entry. Every entry
//! carries its own mutex, so transitions on one job never wait on transitions
//! of another. Each entry also owns a watch channel that publishes the job's
//! state so synchronous callers can block on completion without polling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;

use super::{Job, JobId, JobState, RunResult};
use crate::errors::ExecError;

struct JobEntry {
    job: Mutex<Job>,
    state_tx: watch::Sender<JobState>,
}

impl JobEntry {
    fn lock(&self) -> MutexGuard<'_, Job> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Number of jobs per state, reported by the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

#[derive(Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Arc<JobEntry>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, job: Job) -> Result<JobId, ExecError> {
        let id = job.id;
        let (state_tx, _) = watch::channel(job.state);
        let entry = Arc::new(JobEntry {
            job: Mutex::new(job),
            state_tx,
        });

        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&id) {
            return Err(ExecError::Internal(format!("Job {} already exists", id)));
        }
        jobs.insert(id, entry);
        Ok(id)
    }

    /// Snapshot of a job record.
    pub fn get(&self, id: &JobId) -> Result<Job, ExecError> {
        Ok(self.entry(id)?.lock().clone())
    }

    pub fn state(&self, id: &JobId) -> Result<JobState, ExecError> {
        Ok(self.entry(id)?.lock().state)
    }

    /// Receiver that observes every state change of the job.
    pub fn subscribe(&self, id: &JobId) -> Result<watch::Receiver<JobState>, ExecError> {
        Ok(self.entry(id)?.state_tx.subscribe())
    }

    /// Apply a bare state transition, enforcing the state machine.
    pub fn update_state(&self, id: &JobId, to: JobState) -> Result<Job, ExecError> {
        self.transition(id, to, |_| {})
    }

    /// Take ownership of a queued job on behalf of a worker.
    pub fn claim(&self, id: &JobId) -> Result<Job, ExecError> {
        self.update_state(id, JobState::Running)
    }

    /// Cancel a job that no worker has claimed yet.
    pub fn cancel(&self, id: &JobId) -> Result<Job, ExecError> {
        self.update_state(id, JobState::Cancelled)
            .map_err(|e| match e {
                ExecError::InvalidTransition { job_id, from, .. } => ExecError::NotCancellable {
                    job_id,
                    state: from,
                },
                other => other,
            })
    }

    /// Record the execution outcome and the terminal state in one step.
    pub fn complete(&self, id: &JobId, to: JobState, result: RunResult) -> Result<Job, ExecError> {
        if !to.is_terminal() {
            let from = self.state(id)?;
            return Err(ExecError::InvalidTransition { job_id: *id, from, to });
        }
        self.transition(id, to, move |job| {
            job.output = result.output;
            job.error_text = result.error_text;
            job.exit_code = result.exit_code;
            job.failure = result.failure;
        })
    }

    /// Drop terminal jobs that finished more than `age` ago. Returns how many were removed.
    pub fn evict_terminal_older_than(&self, age: Duration) -> usize {
        let cutoff = Utc::now() - age;
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let before = jobs.len();
        jobs.retain(|_, entry| {
            let job = entry.lock();
            !(job.state.is_terminal() && job.finished_at.is_some_and(|t| t < cutoff))
        });
        before - jobs.len()
    }

    pub fn counts(&self) -> StateCounts {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut counts = StateCounts::default();
        for entry in jobs.values() {
            match entry.lock().state {
                JobState::Queued => counts.queued += 1,
                JobState::Running => counts.running += 1,
                JobState::Succeeded => counts.succeeded += 1,
                JobState::Failed => counts.failed += 1,
                JobState::TimedOut => counts.timed_out += 1,
                JobState::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, id: &JobId) -> Result<Arc<JobEntry>, ExecError> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or(ExecError::NotFound(*id))
    }

    fn transition(
        &self,
        id: &JobId,
        to: JobState,
        apply: impl FnOnce(&mut Job),
    ) -> Result<Job, ExecError> {
        let entry = self.entry(id)?;
        let mut job = entry.lock();
        let from = job.state;
        if !from.can_transition_to(to) {
            return Err(ExecError::InvalidTransition { job_id: *id, from, to });
        }

        apply(&mut *job);
        let now = Utc::now();
        match to {
            JobState::Running => job.started_at = Some(now),
            s if s.is_terminal() => job.finished_at = Some(now),
            _ => {}
        }
        job.state = to;
        entry.state_tx.send_replace(to);
        Ok(job.clone())
    }
}
