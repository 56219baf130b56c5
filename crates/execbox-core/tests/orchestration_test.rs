use async_trait::async_trait;
use execbox_core::config::ExecboxConfig;
use execbox_core::errors::{ExecError, SandboxError};
use execbox_core::executors::{Language, ResourceLimits, RunOutcome, Sandbox};
use execbox_core::gateway::{Gateway, GatewaySettings};
use execbox_core::jobs::{FailureKind, JobId, JobQueue, JobState, JobStore};
use execbox_core::scheduler::WorkerPool;
use execbox_core::service::ExecutionService;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Sandbox whose behaviour is scripted by the submitted code:
/// `sleep:<ms>`, `fail`, `timeout`, `oom`, `infra`, `panic`; anything else is echoed.
#[derive(Default)]
struct ScriptedSandbox {
    running: AtomicUsize,
    max_running: AtomicUsize,
    started: Mutex<Vec<String>>,
}

impl ScriptedSandbox {
    fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn run(
        &self,
        _language: Language,
        code: &str,
        limits: &ResourceLimits,
    ) -> Result<RunOutcome, SandboxError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = RunningGuard(&self.running);
        self.max_running.fetch_max(now, Ordering::SeqCst);
        self.started.lock().unwrap().push(code.to_string());

        if let Some(ms) = code.strip_prefix("sleep:") {
            let ms: u64 = ms.trim().parse().unwrap();
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(RunOutcome {
                stdout: format!("slept {}\n", ms),
                exit_code: Some(0),
                ..RunOutcome::default()
            });
        }

        match code {
            "fail" => Ok(RunOutcome {
                stderr: "ValueError: x\n".to_string(),
                exit_code: Some(1),
                ..RunOutcome::default()
            }),
            "timeout" => {
                tokio::time::sleep(limits.timeout).await;
                Ok(RunOutcome {
                    exit_code: Some(124),
                    timed_out: true,
                    ..RunOutcome::default()
                })
            }
            "oom" => Ok(RunOutcome {
                exit_code: Some(137),
                memory_exceeded: true,
                ..RunOutcome::default()
            }),
            "infra" => Err(SandboxError::Unavailable("runtime went away".to_string())),
            "panic" => panic!("scripted sandbox panic"),
            other => Ok(RunOutcome {
                stdout: format!("{}\n", other),
                exit_code: Some(0),
                ..RunOutcome::default()
            }),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

struct Harness {
    gateway: Gateway,
    sandbox: Arc<ScriptedSandbox>,
    pool: WorkerPool,
}

fn harness(workers: usize, wait_timeout: Duration) -> Harness {
    let store = Arc::new(JobStore::new());
    let queue = Arc::new(JobQueue::new());
    let sandbox = Arc::new(ScriptedSandbox::default());
    let limits = ResourceLimits {
        timeout: Duration::from_millis(200),
        ..ResourceLimits::default()
    };
    let pool = WorkerPool::start(workers, store.clone(), queue.clone(), sandbox.clone(), limits);
    let gateway = Gateway::new(
        store,
        queue,
        GatewaySettings {
            wait_timeout,
            ..GatewaySettings::default()
        },
    );
    Harness {
        gateway,
        sandbox,
        pool,
    }
}

async fn wait_all(gateway: &Gateway, ids: &[JobId]) {
    for id in ids {
        gateway.wait(id, Duration::from_secs(10)).await.unwrap();
    }
}

#[tokio::test]
async fn ten_jobs_on_three_workers_never_exceed_three_running() {
    let h = harness(3, Duration::from_secs(10));
    let ids: Vec<JobId> = (0..10)
        .map(|_| h.gateway.submit("sleep:50", Language::Python).unwrap())
        .collect();

    wait_all(&h.gateway, &ids).await;

    assert!(h.sandbox.max_running() <= 3, "max running {}", h.sandbox.max_running());
    for id in &ids {
        assert_eq!(h.gateway.status(id).unwrap(), JobState::Succeeded);
    }
    h.pool.shutdown().await;
}

#[tokio::test]
async fn single_worker_runs_jobs_in_submission_order() {
    let h = harness(1, Duration::from_secs(10));
    let codes: Vec<String> = (0..5).map(|i| format!("job-{}", i)).collect();
    let ids: Vec<JobId> = codes
        .iter()
        .map(|code| h.gateway.submit(code.clone(), Language::Bash).unwrap())
        .collect();

    wait_all(&h.gateway, &ids).await;

    assert_eq!(h.sandbox.started(), codes);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn queued_job_can_be_cancelled_but_running_job_cannot() {
    let h = harness(1, Duration::from_secs(10));
    let first = h.gateway.submit("sleep:300", Language::Python).unwrap();
    let second = h.gateway.submit("never-runs", Language::Python).unwrap();

    // Let the only worker pick up the first job
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.gateway.status(&first).unwrap(), JobState::Running);

    assert_eq!(h.gateway.cancel(&second).unwrap().state, JobState::Cancelled);
    assert!(matches!(
        h.gateway.cancel(&first),
        Err(ExecError::NotCancellable { state: JobState::Running, .. })
    ));

    let result = h.gateway.wait(&first, Duration::from_secs(5)).await.unwrap();
    assert!(result.success);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.gateway.status(&second).unwrap(), JobState::Cancelled);
    assert!(!h.sandbox.started().contains(&"never-runs".to_string()));
    h.pool.shutdown().await;
}

#[tokio::test]
async fn result_is_idempotent_once_terminal() {
    let h = harness(2, Duration::from_secs(10));
    let result = h.gateway.execute("print(2+3)", Language::Python).await.unwrap();
    assert_eq!(result.state, JobState::Succeeded);

    let again = h.gateway.result(&result.job_id).unwrap();
    let third = h.gateway.result(&result.job_id).unwrap();
    assert_eq!(result, again);
    assert_eq!(again, third);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn wait_timeout_leaves_job_running_and_retrievable() {
    let h = harness(1, Duration::from_millis(100));
    let err = h.gateway.execute("sleep:400", Language::Python).await.unwrap_err();
    let ExecError::WaitTimeout { job_id } = err else {
        panic!("expected wait timeout, got {:?}", err);
    };
    assert!(!h.gateway.status(&job_id).unwrap().is_terminal());

    let result = h.gateway.wait(&job_id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result.output, "slept 400\n");
    h.pool.shutdown().await;
}

#[tokio::test]
async fn every_failure_kind_is_recorded_and_the_pool_keeps_going() {
    let h = harness(2, Duration::from_secs(10));

    let failed = h.gateway.execute("fail", Language::Python).await.unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.exit_code, Some(1));
    assert!(failed.error.contains("ValueError"));
    assert_eq!(failed.failure.map(|f| f.kind), Some(FailureKind::Execution));

    let timed_out = h.gateway.execute("timeout", Language::Python).await.unwrap();
    assert_eq!(timed_out.state, JobState::TimedOut);
    assert_eq!(timed_out.exit_code, Some(124));
    assert!(timed_out.error.contains("timed out"));

    let oom = h.gateway.execute("oom", Language::Python).await.unwrap();
    assert_eq!(oom.state, JobState::Failed);
    assert_eq!(oom.failure.map(|f| f.kind), Some(FailureKind::ResourceLimit));

    let infra = h.gateway.execute("infra", Language::Python).await.unwrap();
    assert_eq!(infra.state, JobState::Failed);
    assert!(infra.exit_code.is_none());
    assert_eq!(infra.failure.map(|f| f.kind), Some(FailureKind::Infrastructure));

    let panicked = h.gateway.execute("panic", Language::Python).await.unwrap();
    assert_eq!(panicked.failure.map(|f| f.kind), Some(FailureKind::Infrastructure));

    // Both workers are still alive
    let ids: Vec<JobId> = (0..4)
        .map(|_| h.gateway.submit("sleep:20", Language::Python).unwrap())
        .collect();
    wait_all(&h.gateway, &ids).await;
    h.pool.shutdown().await;
}

#[tokio::test]
async fn shutdown_lets_in_flight_jobs_finish() {
    let h = harness(1, Duration::from_secs(10));
    let running = h.gateway.submit("sleep:200", Language::Python).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.pool.shutdown().await;

    assert_eq!(h.gateway.status(&running).unwrap(), JobState::Succeeded);
    let late = h.gateway.submit("after-shutdown", Language::Python).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.gateway.status(&late).unwrap(), JobState::Queued);
}

#[tokio::test]
async fn service_runs_jobs_on_a_provided_sandbox() {
    let mut config = ExecboxConfig::default();
    config.execution.workers = 2;
    config.execution.languages = vec![Language::Python, Language::Bash];
    let sandbox = Arc::new(ScriptedSandbox::default());

    let service = ExecutionService::with_sandbox(&config, sandbox.clone()).unwrap();
    assert_eq!(service.workers(), 2);
    assert_eq!(service.backend(), "scripted");

    let gateway = service.gateway();
    let result = gateway.execute("hello", Language::Python).await.unwrap();
    assert_eq!(result.output, "hello\n");
    assert!(matches!(
        gateway.submit("hello", Language::Java),
        Err(ExecError::UnsupportedLanguage(_))
    ));
    assert_eq!(service.completion().suggest("print(", 6).await, "");

    service.shutdown().await;
}
