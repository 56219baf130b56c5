//! Submission gateway: the only way jobs enter the system.
//!
//! Validation failures never create a job. Accepted jobs are stored as
//! `Queued` and pushed onto the intake queue in one step, so workers see them
//! in submission order. Synchronous callers block on the job's watch channel
//! rather than polling the store.

use std::sync::Arc;
use std::time::Duration;

use crate::errors::ExecError;
use crate::executors::Language;
use crate::jobs::{Job, JobId, JobQueue, JobResult, JobState, JobStore};

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub languages: Vec<Language>,
    pub max_code_bytes: usize,
    pub wait_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            languages: Language::ALL.to_vec(),
            max_code_bytes: 256 * 1024,
            wait_timeout: Duration::from_secs(35),
        }
    }
}

pub struct Gateway {
    store: Arc<JobStore>,
    queue: Arc<JobQueue>,
    settings: GatewaySettings,
}

impl Gateway {
    pub fn new(store: Arc<JobStore>, queue: Arc<JobQueue>, settings: GatewaySettings) -> Self {
        Self {
            store,
            queue,
            settings,
        }
    }

    /// Resolve a language name or alias, rejecting languages that are not enabled.
    pub fn parse_language(&self, name: &str) -> Result<Language, ExecError> {
        let language: Language = name.parse()?;
        if !self.settings.languages.contains(&language) {
            return Err(ExecError::UnsupportedLanguage(format!(
                "{} is not enabled on this server",
                language
            )));
        }
        Ok(language)
    }

    /// Validate, store as `Queued` and enqueue. Returns without waiting.
    pub fn submit(&self, code: impl Into<String>, language: Language) -> Result<JobId, ExecError> {
        let code = code.into();
        self.validate(&code, language)?;

        let job = Job::new(code, language);
        let job_id = self.store.create(job)?;
        self.queue.push(job_id);
        log::info!(
            "Submitted job {} ({}), queue depth {}",
            job_id,
            language,
            self.queue.len()
        );
        Ok(job_id)
    }

    pub fn status(&self, job_id: &JobId) -> Result<JobState, ExecError> {
        self.store.state(job_id)
    }

    /// Terminal result of a job. Repeated calls return the same result.
    pub fn result(&self, job_id: &JobId) -> Result<JobResult, ExecError> {
        let job = self.store.get(job_id)?;
        if !job.state.is_terminal() {
            return Err(ExecError::NotReady {
                job_id: *job_id,
                state: job.state,
            });
        }
        Ok(job.result())
    }

    pub fn job(&self, job_id: &JobId) -> Result<Job, ExecError> {
        self.store.get(job_id)
    }

    /// Submit and block until the job is terminal or the wait window closes.
    ///
    /// On `WaitTimeout` the job keeps running; its result stays available
    /// through [`Gateway::result`].
    pub async fn execute(&self, code: impl Into<String>, language: Language) -> Result<JobResult, ExecError> {
        let job_id = self.submit(code, language)?;
        self.wait(&job_id, self.settings.wait_timeout).await
    }

    pub async fn wait(&self, job_id: &JobId, timeout: Duration) -> Result<JobResult, ExecError> {
        let mut state_rx = self.store.subscribe(job_id)?;
        let waited = tokio::time::timeout(timeout, state_rx.wait_for(|state| state.is_terminal()))
            .await
            .map(|changed| changed.map(|_| ()));
        match waited {
            Ok(Ok(())) => self.result(job_id),
            // Sender dropped: the job was evicted while we waited
            Ok(Err(_)) => Err(ExecError::NotFound(*job_id)),
            Err(_) => {
                log::warn!(
                    "Gave up waiting for job {} after {:?}; it keeps running",
                    job_id,
                    timeout
                );
                Err(ExecError::WaitTimeout { job_id: *job_id })
            }
        }
    }

    /// Cancel a job that has not started yet.
    pub fn cancel(&self, job_id: &JobId) -> Result<Job, ExecError> {
        let job = self.store.cancel(job_id)?;
        self.queue.remove(job_id);
        log::info!("Cancelled job {}", job_id);
        Ok(job)
    }

    pub fn languages(&self) -> &[Language] {
        &self.settings.languages
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    fn validate(&self, code: &str, language: Language) -> Result<(), ExecError> {
        if code.trim().is_empty() {
            return Err(ExecError::Validation("code must not be empty".to_string()));
        }
        if code.len() > self.settings.max_code_bytes {
            return Err(ExecError::Validation(format!(
                "code is {} bytes, the limit is {} bytes",
                code.len(),
                self.settings.max_code_bytes
            )));
        }
        if !self.settings.languages.contains(&language) {
            return Err(ExecError::UnsupportedLanguage(format!(
                "{} is not enabled on this server",
                language
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::RunResult;

    fn gateway(settings: GatewaySettings) -> Gateway {
        Gateway::new(Arc::new(JobStore::new()), Arc::new(JobQueue::new()), settings)
    }

    #[test]
    fn rejects_blank_code_without_creating_a_job() {
        let gateway = gateway(GatewaySettings::default());
        for code in ["", "   \n\t"] {
            let err = gateway.submit(code, Language::Python).unwrap_err();
            assert!(matches!(err, ExecError::Validation(_)));
        }
        assert!(gateway.store().is_empty());
        assert_eq!(gateway.queue_depth(), 0);
    }

    #[test]
    fn rejects_oversized_code() {
        let gateway = gateway(GatewaySettings {
            max_code_bytes: 8,
            ..GatewaySettings::default()
        });
        assert!(gateway.submit("print(1)", Language::Python).is_ok());
        let err = gateway.submit("print(12)", Language::Python).unwrap_err();
        assert!(matches!(err, ExecError::Validation(_)));
    }

    #[test]
    fn rejects_disabled_and_unknown_languages() {
        let gateway = gateway(GatewaySettings {
            languages: vec![Language::Python],
            ..GatewaySettings::default()
        });
        assert!(matches!(
            gateway.submit("echo hi", Language::Bash),
            Err(ExecError::UnsupportedLanguage(_))
        ));
        assert!(matches!(
            gateway.parse_language("bash"),
            Err(ExecError::UnsupportedLanguage(_))
        ));
        assert!(matches!(
            gateway.parse_language("cobol"),
            Err(ExecError::UnsupportedLanguage(_))
        ));
        assert_eq!(gateway.parse_language("Python3").unwrap(), Language::Python);
    }

    #[test]
    fn submitted_job_is_queued_and_not_ready() {
        let gateway = gateway(GatewaySettings::default());
        let id = gateway.submit("print(2+3)", Language::Python).unwrap();
        assert_eq!(gateway.status(&id).unwrap(), JobState::Queued);
        assert_eq!(gateway.queue_depth(), 1);
        assert!(matches!(
            gateway.result(&id),
            Err(ExecError::NotReady { state: JobState::Queued, .. })
        ));
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let gateway = gateway(GatewaySettings::default());
        let id = uuid::Uuid::new_v4();
        assert!(matches!(gateway.status(&id), Err(ExecError::NotFound(_))));
        assert!(matches!(gateway.result(&id), Err(ExecError::NotFound(_))));
        assert!(matches!(gateway.cancel(&id), Err(ExecError::NotFound(_))));
    }

    #[test]
    fn cancel_removes_queued_job() {
        let gateway = gateway(GatewaySettings::default());
        let id = gateway.submit("print(1)", Language::Python).unwrap();
        let job = gateway.cancel(&id).unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(gateway.queue_depth(), 0);

        let result = gateway.result(&id).unwrap();
        assert!(!result.success);
        assert!(result.exit_code.is_none());
        assert!(matches!(
            gateway.cancel(&id),
            Err(ExecError::NotCancellable { state: JobState::Cancelled, .. })
        ));
    }

    #[tokio::test]
    async fn execute_times_out_when_nobody_runs_the_job() {
        let gateway = gateway(GatewaySettings {
            wait_timeout: Duration::from_millis(50),
            ..GatewaySettings::default()
        });
        let err = gateway.execute("print(1)", Language::Python).await.unwrap_err();
        let ExecError::WaitTimeout { job_id } = err else {
            panic!("expected wait timeout, got {:?}", err);
        };
        assert_eq!(gateway.status(&job_id).unwrap(), JobState::Queued);
    }

    #[tokio::test]
    async fn execute_returns_once_the_job_completes() {
        let store = Arc::new(JobStore::new());
        let queue = Arc::new(JobQueue::new());
        let gateway = Gateway::new(store.clone(), queue.clone(), GatewaySettings::default());

        let runner = tokio::spawn(async move {
            let id = queue.pop().await;
            store.claim(&id).unwrap();
            store
                .complete(
                    &id,
                    JobState::Succeeded,
                    RunResult {
                        output: "5\n".to_string(),
                        exit_code: Some(0),
                        ..RunResult::default()
                    },
                )
                .unwrap();
        });

        let result = gateway.execute("print(2+3)", Language::Python).await.unwrap();
        runner.await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, "5\n");
        assert_eq!(gateway.result(&result.job_id).unwrap(), result);
    }
}
