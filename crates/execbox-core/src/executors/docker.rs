// src/executors/docker.rs
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    InspectContainerOptions as BollardInspectContainerOptionsQuery,
    KillContainerOptions as BollardKillContainerOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use tempfile::Builder;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::language::CONTAINER_WORK_DIR;
use super::output::OutputBuffer;
use super::{Language, ResourceLimits, RunOutcome, Sandbox, TIMEOUT_EXIT_CODE};
use crate::errors::SandboxError;

const SANDBOX_USER: &str = "1000:1000";
const TMPFS_OPTIONS: &str = "rw,nosuid,size=64m";

pub struct DockerSandbox {
    docker: Docker,
    images: HashMap<Language, String>,
}

impl DockerSandbox {
    /// Connect to the local Docker daemon. `images` overrides the default image per language.
    pub fn new(images: HashMap<Language, String>) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker, images })
    }

    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::Unavailable(format!("Docker daemon not reachable: {}", e)))
    }

    fn image_for(&self, language: Language) -> String {
        self.images
            .get(&language)
            .cloned()
            .unwrap_or_else(|| language.recipe().image.to_string())
    }

    /// Pull the images of `languages` ahead of the first job. Failures are
    /// logged; a run retries the pull within its own bound.
    pub async fn prefetch_images(&self, languages: &[Language]) {
        for &language in languages {
            let image = self.image_for(language);
            match self.ensure_image(&image).await {
                Ok(()) => log::debug!("Sandbox image {} ready for {}", image, language),
                Err(e) => log::warn!("Could not prefetch image {} for {}: {}", image, language, e),
            }
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        log::info!("Pulling sandbox image {}", image);
        let pull_options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(image.to_string()),
            ..Default::default()
        });
        let mut pull_stream = self.docker.create_image(pull_options, None, None);
        while let Some(progress) = pull_stream.next().await {
            if let Err(e) = progress {
                return Err(SandboxError::Unavailable(format!(
                    "Failed to pull image {}: {}",
                    image, e
                )));
            }
        }
        Ok(())
    }

    fn container_config(
        &self,
        language: Language,
        host_dir: &str,
        limits: &ResourceLimits,
    ) -> ContainerCreateBody {
        let memory_bytes =
            i64::try_from(limits.memory_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX);
        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), TMPFS_OPTIONS.to_string());

        ContainerCreateBody {
            image: Some(self.image_for(language)),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                language.recipe().container_command.to_string(),
            ]),
            working_dir: Some(CONTAINER_WORK_DIR.to_string()),
            user: Some(SANDBOX_USER.to_string()),
            env: Some(vec![
                "HOME=/tmp".to_string(),
                "GOCACHE=/tmp/go-cache".to_string(),
                "GOPATH=/tmp/go".to_string(),
                "JULIA_DEPOT_PATH=/tmp/julia".to_string(),
            ]),
            network_disabled: Some(limits.network_disabled),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}:ro", host_dir, CONTAINER_WORK_DIR)]),
                memory: Some(memory_bytes),
                memory_swap: Some(memory_bytes),
                nano_cpus: Some((limits.cpus * 1_000_000_000.0) as i64),
                pids_limit: Some(limits.pids_limit),
                network_mode: limits.network_disabled.then(|| "none".to_string()),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges:true".to_string()]),
                readonly_rootfs: Some(true),
                tmpfs: Some(tmpfs),
                // Removal is done by ContainerGuard once logs and OOM state are read
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Start the container and wait for it to exit or hit the deadline.
    async fn drive(
        &self,
        container_id: &str,
        limits: &ResourceLimits,
    ) -> Result<RunOutcome, SandboxError> {
        self.docker
            .start_container(container_id, None::<BollardStartContainerOptionsQuery>)
            .await?;

        let mut wait_stream = self
            .docker
            .wait_container(container_id, None::<BollardWaitContainerOptionsQuery>);
        let timeout_future = tokio::time::sleep(limits.timeout);

        let (exit_code, timed_out) = tokio::select! {
            res = wait_stream.next() => match res {
                Some(Ok(response)) => (Some(response.status_code), false),
                // bollard reports a non-zero exit as an error carrying the code
                Some(Err(BollardError::DockerContainerWaitError { code, .. })) => (Some(code), false),
                Some(Err(e)) => return Err(SandboxError::Docker(e)),
                None => {
                    return Err(SandboxError::Unavailable(
                        "Container wait stream ended unexpectedly".to_string(),
                    ))
                }
            },
            _ = timeout_future => {
                log::warn!("Execution timed out for container {}", container_id);
                let kill = self
                    .docker
                    .kill_container(
                        container_id,
                        Some(BollardKillContainerOptionsQuery {
                            signal: "SIGKILL".to_string(),
                        }),
                    )
                    .await;
                if let Err(e) = kill {
                    log::debug!("Kill after timeout failed for {}: {}", container_id, e);
                }
                (Some(TIMEOUT_EXIT_CODE), true)
            }
        };

        let (stdout, stderr) = self.collect_logs(container_id, limits.max_output_bytes).await?;

        let memory_exceeded = !timed_out && self.oom_killed(container_id).await?;

        Ok(RunOutcome {
            stdout,
            stderr,
            exit_code,
            timed_out,
            memory_exceeded,
        })
    }

    /// Whether the kernel OOM-killed the container; stderr text is not evidence.
    async fn oom_killed(&self, container_id: &str) -> Result<bool, SandboxError> {
        let state = self
            .docker
            .inspect_container(container_id, None::<BollardInspectContainerOptionsQuery>)
            .await?
            .state;
        Ok(state.and_then(|state| state.oom_killed).unwrap_or(false))
    }

    async fn collect_logs(
        &self,
        container_id: &str,
        max_output_bytes: usize,
    ) -> Result<(String, String), SandboxError> {
        let mut output_stream = self.docker.logs(
            container_id,
            Some(BollardLogsOptionsQuery {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut stdout = OutputBuffer::new(max_output_bytes);
        let mut stderr = OutputBuffer::new(max_output_bytes);
        while let Some(log_result) = output_stream.next().await {
            match log_result? {
                LogOutput::StdOut { message } => stdout.push(&message),
                LogOutput::StdErr { message } => stderr.push(&message),
                _ => {}
            }
        }
        Ok((stdout.text(), stderr.text()))
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn run(
        &self,
        language: Language,
        code: &str,
        limits: &ResourceLimits,
    ) -> Result<RunOutcome, SandboxError> {
        let temp_dir = Builder::new().prefix("execbox-").tempdir()?;
        let host_dir = temp_dir
            .path()
            .to_str()
            .ok_or_else(|| SandboxError::TempWorkspace("Invalid temp path".to_string()))?
            .to_string();

        let host_script_path = temp_dir.path().join(language.recipe().file_name);
        let mut file = fs::File::create(&host_script_path).await?;
        file.write_all(code.as_bytes()).await?;
        file.flush().await?;

        // The container runs as an unprivileged uid and must be able to read the mount
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(temp_dir.path(), std::fs::Permissions::from_mode(0o755)).await?;
            fs::set_permissions(&host_script_path, std::fs::Permissions::from_mode(0o644))
                .await?;
        }

        let image = self.image_for(language);
        within_pull_deadline(&image, limits.timeout, self.ensure_image(&image)).await?;

        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(format!("execbox-{}", Uuid::new_v4())),
            ..Default::default()
        });
        let config = self.container_config(language, &host_dir, limits);
        let container = self.docker.create_container(options, config).await?;
        let guard = ContainerGuard::new(self.docker.clone(), container.id);

        let outcome = self.drive(&guard.id, limits).await;
        guard.release().await;
        // temp_dir is removed when it goes out of scope
        outcome
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

/// Bound an image pull so a stalled registry cannot hold a job past its deadline.
async fn within_pull_deadline<F>(image: &str, deadline: Duration, pull: F) -> Result<(), SandboxError>
where
    F: Future<Output = Result<(), SandboxError>>,
{
    tokio::time::timeout(deadline, pull).await.unwrap_or_else(|_| {
        Err(SandboxError::Unavailable(format!(
            "Image {} was not available within {} seconds",
            image,
            deadline.as_secs()
        )))
    })
}

/// Owns a created container and force-removes it exactly once.
struct ContainerGuard {
    docker: Docker,
    id: String,
    released: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, id: String) -> Self {
        Self {
            docker,
            id,
            released: false,
        }
    }

    async fn release(mut self) {
        self.released = true;
        remove_container(&self.docker, &self.id).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Reached when the owning future is dropped mid-run
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let docker = self.docker.clone();
            let id = std::mem::take(&mut self.id);
            handle.spawn(async move { remove_container(&docker, &id).await });
        } else {
            log::error!("Container {} leaked: no runtime available for cleanup", self.id);
        }
    }
}

async fn remove_container(docker: &Docker, id: &str) {
    let options = Some(BollardRemoveContainerOptionsQuery {
        force: true,
        v: true,
        ..Default::default()
    });
    match docker.remove_container(id, options).await {
        Ok(()) => log::debug!("Removed container {}", id),
        Err(e) => log::error!("Failed to remove container {}: {}", id, e),
    }
}
