//! Host-process sandbox for machines without a container runtime.
//!
//! Each run gets its own temporary directory and its own process group. The
//! memory ceiling is an `RLIMIT_DATA` set in the child before exec: the job's
//! budget plus the runtime's own allowance ([`Recipe::host_memory_allowance_mb`]).
//! When the host's `unshare` can create user namespaces, every run also gets a
//! private PID namespace (and network namespace when isolation is on). Killing
//! the process group then takes the namespace down with it, including
//! descendants that called `setsid`. CPU throttling and process-count limits
//! are not available here; use the Docker backend where they matter.
//!
//! [`Recipe::host_memory_allowance_mb`]: super::Recipe::host_memory_allowance_mb

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::Builder;
use tokio::fs;
use tokio::process::Command;
use tokio::task::JoinHandle;
use which::which;

use super::output::{lock, OutputBuffer, SharedOutput};
use super::{Language, ResourceLimits, RunOutcome, Sandbox, TIMEOUT_EXIT_CODE};
use crate::errors::SandboxError;

/// How long to wait for output pipes to close after the process group is gone.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Exit code of a process killed with SIGKILL, as a shell reports it.
const SIGKILL_EXIT_CODE: i64 = 128 + 9;

/// `unshare` arguments for a run whose whole process tree dies with its first process.
const NAMESPACE_ARGS: [&str; 4] = ["--map-root-user", "--pid", "--fork", "--kill-child"];

#[derive(Debug, Clone)]
pub struct LocalSandbox {
    /// `unshare`, when it can create the per-run namespaces on this host.
    unshare: Option<PathBuf>,
    network_isolation: bool,
}

impl LocalSandbox {
    /// Build a local sandbox. With `network_isolation` the host must let
    /// `unshare` create user and network namespaces.
    pub fn new(network_isolation: bool) -> Result<Self, SandboxError> {
        let unshare = which("unshare")
            .ok()
            .filter(|path| namespaces_available(path));
        if unshare.is_none() {
            if network_isolation {
                return Err(SandboxError::Unavailable(
                    "network isolation requires `unshare` with unprivileged user namespaces"
                        .to_string(),
                ));
            }
            log::warn!(
                "`unshare` cannot create namespaces on this host; \
                 processes that leave their process group may outlive their job"
            );
        }
        Ok(Self {
            unshare,
            network_isolation,
        })
    }

    /// Whether each run's descendants are confined to a PID namespace that dies with the run.
    pub fn contains_process_tree(&self) -> bool {
        self.unshare.is_some()
    }

    fn command(&self, language: Language, limits: &ResourceLimits) -> Command {
        let script = language
            .recipe()
            .host_command
            .replace("{heap_mb}", &limits.memory_mb.to_string());

        let mut cmd = match &self.unshare {
            Some(unshare) => {
                let mut cmd = Command::new(unshare);
                cmd.args(NAMESPACE_ARGS);
                if self.network_isolation && limits.network_disabled {
                    cmd.arg("--net");
                }
                cmd.arg("sh");
                cmd
            }
            None => Command::new("sh"),
        };
        cmd.arg("-c").arg(script);
        cmd
    }
}

fn namespaces_available(unshare: &Path) -> bool {
    std::process::Command::new(unshare)
        .args(NAMESPACE_ARGS)
        .arg("--net")
        .arg("true")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn data_limit_bytes(language: Language, limits: &ResourceLimits) -> u64 {
    limits
        .memory_mb
        .saturating_add(language.recipe().host_memory_allowance_mb)
        .saturating_mul(1024 * 1024)
}

#[cfg(unix)]
fn limit_data_segment(cmd: &mut Command, bytes: u64) {
    use nix::sys::resource::{setrlimit, Resource};

    // SAFETY: the hook runs between fork and exec and only calls setrlimit(2),
    // which is async-signal-safe and does not allocate.
    unsafe {
        cmd.pre_exec(move || {
            setrlimit(Resource::RLIMIT_DATA, bytes, bytes).map_err(std::io::Error::from)
        });
    }
}

/// A failed run ran out of memory when the kernel killed it or its runtime said so.
fn ran_out_of_memory(language: Language, exit_code: Option<i64>, stderr: &str) -> bool {
    match exit_code {
        Some(0) => false,
        Some(SIGKILL_EXIT_CODE) => true,
        _ => language.reports_out_of_memory(stderr),
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn run(
        &self,
        language: Language,
        code: &str,
        limits: &ResourceLimits,
    ) -> Result<RunOutcome, SandboxError> {
        let temp_dir = Builder::new().prefix("execbox-").tempdir()?;
        let script_path = temp_dir.path().join(language.recipe().file_name);
        fs::write(&script_path, code).await?;

        let mut cmd = self.command(language, limits);
        cmd.current_dir(temp_dir.path())
            .env("HOME", temp_dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            cmd.process_group(0);
            limit_data_segment(&mut cmd, data_limit_bytes(language, limits));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("{}: {}", language, e)))?;
        let mut group = ProcessGroup::new(child.id());

        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn("stdout pipe missing".to_string()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Spawn("stderr pipe missing".to_string()))?;
        let stdout = OutputBuffer::shared(limits.max_output_bytes);
        let stderr = OutputBuffer::shared(limits.max_output_bytes);
        let stdout_reader = tokio::spawn(OutputBuffer::drain(stdout_pipe, stdout.clone()));
        let stderr_reader = tokio::spawn(OutputBuffer::drain(stderr_pipe, stderr.clone()));

        let (status, timed_out) = tokio::select! {
            status = child.wait() => (Some(status?), false),
            _ = tokio::time::sleep(limits.timeout) => {
                log::warn!("Execution timed out for local process group {:?}", group.pgid);
                (None, true)
            }
        };

        // Background children share the group; nothing may outlive the job
        group.kill();
        if timed_out {
            if let Err(e) = child.kill().await {
                log::debug!("Child already gone after group kill: {}", e);
            }
        }

        let stdout = collect(stdout_reader, &stdout, PIPE_DRAIN_GRACE).await;
        let stderr = collect(stderr_reader, &stderr, PIPE_DRAIN_GRACE).await;

        let exit_code = if timed_out {
            Some(TIMEOUT_EXIT_CODE)
        } else {
            status.map(exit_code_of)
        };
        let memory_exceeded = !timed_out && ran_out_of_memory(language, exit_code, &stderr);

        drop(temp_dir);
        Ok(RunOutcome {
            stdout,
            stderr,
            exit_code,
            timed_out,
            memory_exceeded,
        })
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Wait for a reader to hit EOF, then return what it buffered. A pipe held open
/// by an escaped process stops the wait after `grace` without losing output.
async fn collect(mut reader: JoinHandle<()>, buffer: &SharedOutput, grace: Duration) -> String {
    match tokio::time::timeout(grace, &mut reader).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("Output reader task failed: {}", e),
        Err(_) => {
            log::warn!("Output pipe still open after process group was killed");
            reader.abort();
        }
    }
    lock(buffer).text()
}

fn exit_code_of(status: std::process::ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return code as i64;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal as i64;
        }
    }
    -1
}

/// Process group of one run; killed by `kill()`, or on drop if that never happened.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else { return };
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => log::error!("Failed to signal process group {}: {}", pgid, e),
            }
        }
        #[cfg(not(unix))]
        log::debug!("Process groups are not supported; leaving {} to kill_on_drop", pgid);
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}
