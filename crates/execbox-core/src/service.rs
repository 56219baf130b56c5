//! Wires the store, queue, worker pool, retention reaper and gateway together.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::completion::{provider_from_config, SuggestionProvider};
use crate::config::{ExecboxConfig, ExecutionConfig, SandboxBackend};
use crate::errors::ExecError;
use crate::executors::{DockerSandbox, LocalSandbox, Sandbox};
use crate::gateway::{Gateway, GatewaySettings};
use crate::jobs::{JobQueue, JobStore};
use crate::scheduler::WorkerPool;

/// Upper bound on how often finished jobs are swept.
const MAX_REAP_INTERVAL: Duration = Duration::from_secs(60);

struct Reaper {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

pub struct ExecutionService {
    gateway: Arc<Gateway>,
    completion: Arc<dyn SuggestionProvider>,
    pool: WorkerPool,
    reaper: Option<Reaper>,
    backend: &'static str,
}

impl ExecutionService {
    /// Build the configured sandbox backend and start the service on it.
    pub async fn start(config: &ExecboxConfig) -> Result<Self, ExecError> {
        let sandbox = build_sandbox(&config.execution).await?;
        Self::with_sandbox(config, sandbox)
    }

    /// Start the service on an already constructed sandbox.
    pub fn with_sandbox(config: &ExecboxConfig, sandbox: Arc<dyn Sandbox>) -> Result<Self, ExecError> {
        config.validate()?;
        let execution = &config.execution;

        let store = Arc::new(JobStore::new());
        let queue = Arc::new(JobQueue::new());
        let backend = sandbox.name();

        let completion = provider_from_config(&config.completion)
            .map_err(|e| ExecError::Config(format!("Invalid completion settings: {}", e)))?;

        let reaper = match execution.retention() {
            Some(retention) => Some(spawn_reaper(store.clone(), retention)?),
            None => None,
        };

        let pool = WorkerPool::start(
            execution.workers,
            store.clone(),
            queue.clone(),
            sandbox,
            execution.limits(),
        );

        let gateway = Arc::new(Gateway::new(
            store,
            queue,
            GatewaySettings {
                languages: execution.languages.clone(),
                max_code_bytes: execution.max_code_bytes,
                wait_timeout: execution.wait_timeout(),
            },
        ));

        Ok(Self {
            gateway,
            completion,
            pool,
            reaper,
            backend,
        })
    }

    pub fn gateway(&self) -> Arc<Gateway> {
        self.gateway.clone()
    }

    pub fn completion(&self) -> Arc<dyn SuggestionProvider> {
        self.completion.clone()
    }

    pub fn workers(&self) -> usize {
        self.pool.size()
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Stop accepting work from the queue, let running jobs finish, stop the reaper.
    pub async fn shutdown(self) {
        if let Some(reaper) = self.reaper {
            reaper.shutdown.cancel();
            if let Err(e) = reaper.handle.await {
                log::error!("Retention reaper ended abnormally: {}", e);
            }
        }
        self.pool.shutdown().await;
    }
}

async fn build_sandbox(execution: &ExecutionConfig) -> Result<Arc<dyn Sandbox>, ExecError> {
    match execution.backend {
        SandboxBackend::Docker => {
            let sandbox = DockerSandbox::new(execution.images.clone())
                .map_err(|e| ExecError::Config(format!("Docker backend unavailable: {}", e)))?;
            sandbox.ping().await.map_err(|e| {
                ExecError::Config(format!(
                    "{}; start Docker or select the local backend (DOCKER_SANDBOX=0)",
                    e
                ))
            })?;
            log::info!("Using Docker sandbox backend");
            let sandbox = Arc::new(sandbox);
            let prefetch = sandbox.clone();
            let languages = execution.languages.clone();
            tokio::spawn(async move { prefetch.prefetch_images(&languages).await });
            Ok(sandbox)
        }
        SandboxBackend::Local => {
            let sandbox = LocalSandbox::new(execution.network_isolation).map_err(|e| {
                ExecError::Config(format!(
                    "{}; install util-linux or set execution.network_isolation: false",
                    e
                ))
            })?;
            log::warn!(
                "Using local sandbox backend: execution.cpus ({}) and pids_limit are not enforced",
                execution.cpus
            );
            Ok(Arc::new(sandbox))
        }
    }
}

fn spawn_reaper(store: Arc<JobStore>, retention: Duration) -> Result<Reaper, ExecError> {
    let max_age = chrono::Duration::from_std(retention)
        .map_err(|e| ExecError::Config(format!("Invalid retention period: {}", e)))?;
    let period = retention.min(MAX_REAP_INTERVAL);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = store.evict_terminal_older_than(max_age);
                    if evicted > 0 {
                        log::info!("Evicted {} finished jobs older than {:?}", evicted, retention);
                    }
                }
            }
        }
    });

    Ok(Reaper { handle, shutdown })
}
