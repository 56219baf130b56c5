//! End-to-end runs through the service on the local (host process) backend.
//!
//! Scenarios that need an interpreter the host does not have are skipped.

use execbox_core::config::{ExecboxConfig, SandboxBackend};
use execbox_core::executors::{Language, LocalSandbox, ResourceLimits, Sandbox};
use execbox_core::jobs::{FailureKind, JobState};
use execbox_core::service::ExecutionService;
use std::path::Path;
use std::time::{Duration, Instant};

fn has(binary: &str) -> bool {
    if which::which(binary).is_ok() {
        true
    } else {
        eprintln!("skipping: {} not installed", binary);
        false
    }
}

async fn local_service(timeout_secs: u64) -> ExecutionService {
    let mut config = ExecboxConfig::default();
    config.execution.backend = SandboxBackend::Local;
    config.execution.network_isolation = false;
    config.execution.workers = 2;
    config.execution.timeout_secs = timeout_secs;
    config.execution.wait_timeout_secs = timeout_secs + 10;
    ExecutionService::start(&config).await.unwrap()
}

#[tokio::test]
async fn python_arithmetic_succeeds() {
    if !has("python3") {
        return;
    }
    let service = local_service(10).await;
    let result = service
        .gateway()
        .execute("print(2+3)", Language::Python)
        .await
        .unwrap();
    assert_eq!(result.state, JobState::Succeeded);
    assert_eq!(result.output, "5\n");
    assert!(result.success);
    assert_eq!(result.exit_code, Some(0));
    service.shutdown().await;
}

#[tokio::test]
async fn python_exception_fails_with_traceback() {
    if !has("python3") {
        return;
    }
    let service = local_service(10).await;
    let result = service
        .gateway()
        .execute("raise ValueError('x')", Language::Python)
        .await
        .unwrap();
    assert_eq!(result.state, JobState::Failed);
    assert!(!result.success);
    assert!(result.error.contains("ValueError"));
    assert_eq!(result.failure.map(|f| f.kind), Some(FailureKind::Execution));
    service.shutdown().await;
}

#[tokio::test]
async fn python_memory_hog_hits_the_limit() {
    if !has("python3") {
        return;
    }
    let service = local_service(10).await;
    let result = service
        .gateway()
        .execute("x = bytearray(1024 * 1024 * 1024)", Language::Python)
        .await
        .unwrap();
    assert_eq!(result.state, JobState::Failed);
    assert_eq!(result.failure.map(|f| f.kind), Some(FailureKind::ResourceLimit));
    service.shutdown().await;
}

#[tokio::test]
async fn infinite_loop_is_killed_at_the_deadline() {
    if !has("bash") {
        return;
    }
    let service = local_service(2).await;
    let started = Instant::now();
    let result = service
        .gateway()
        .execute("while :; do :; done", Language::Bash)
        .await
        .unwrap();
    assert_eq!(result.state, JobState::TimedOut);
    assert_eq!(result.exit_code, Some(124));
    assert!(result.error.contains("timed out (2 seconds limit)"));
    assert!(started.elapsed() < Duration::from_secs(8));
    service.shutdown().await;
}

#[tokio::test]
async fn background_children_do_not_outlive_the_job() {
    if !has("bash") {
        return;
    }
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("escaped");
    let code = format!("(sleep 1; touch {}) &\necho started", marker.display());

    let service = local_service(10).await;
    let started = Instant::now();
    let result = service.gateway().execute(code, Language::Bash).await.unwrap();
    assert_eq!(result.output, "started\n");
    assert!(started.elapsed() < Duration::from_secs(5));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!marker.exists(), "background process survived its job");
    service.shutdown().await;
}

#[tokio::test]
async fn every_run_gets_a_fresh_workspace_that_is_removed() {
    if !has("bash") {
        return;
    }
    let service = local_service(10).await;
    let gateway = service.gateway();

    let first = gateway
        .execute("echo secret > data.txt; pwd", Language::Bash)
        .await
        .unwrap();
    assert!(first.success);
    let workspace = first.output.trim().to_string();
    assert!(!Path::new(&workspace).exists(), "workspace {} was left behind", workspace);

    let second = gateway.execute("cat data.txt", Language::Bash).await.unwrap();
    assert_eq!(second.state, JobState::Failed);
    assert!(second.output.is_empty());
    service.shutdown().await;
}

#[tokio::test]
async fn oversized_output_is_truncated() {
    if !has("bash") {
        return;
    }
    let mut config = ExecboxConfig::default();
    config.execution.backend = SandboxBackend::Local;
    config.execution.network_isolation = false;
    config.execution.max_output_bytes = 1024;
    let service = ExecutionService::start(&config).await.unwrap();

    let result = service
        .gateway()
        .execute("for i in $(seq 1 1000); do echo line-$i; done", Language::Bash)
        .await
        .unwrap();
    assert!(result.success);
    assert!(result.output.starts_with("line-1\n"));
    assert!(result.output.contains("[output truncated at 1024 bytes]"));
    service.shutdown().await;
}

#[tokio::test]
async fn javascript_runs_under_default_limits() {
    if !has("node") {
        return;
    }
    let service = local_service(30).await;
    let result = service
        .gateway()
        .execute("console.log('Hello')", Language::Javascript)
        .await
        .unwrap();
    assert_eq!(result.state, JobState::Succeeded, "stderr: {}", result.error);
    assert_eq!(result.output, "Hello\n");
    service.shutdown().await;
}

#[tokio::test]
async fn setsid_escapees_die_with_the_job() {
    if !has("setsid") {
        return;
    }
    let sandbox = LocalSandbox::new(false).unwrap();
    if !sandbox.contains_process_tree() {
        eprintln!("skipping: unshare cannot create namespaces here");
        return;
    }
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("escaped");
    let code = format!(
        "setsid sh -c 'sleep 2; touch {}' &\necho hi",
        marker.display()
    );

    let started = Instant::now();
    let outcome = sandbox
        .run(Language::Bash, &code, &ResourceLimits::default())
        .await
        .unwrap();
    assert_eq!(outcome.stdout, "hi\n");
    assert_eq!(outcome.exit_code, Some(0));
    assert!(started.elapsed() < Duration::from_secs(2));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!marker.exists(), "setsid child survived its job");
}

#[tokio::test]
async fn network_isolation_leaves_only_loopback() {
    let sandbox = match LocalSandbox::new(true) {
        Ok(sandbox) => sandbox,
        Err(e) => {
            eprintln!("skipping: {}", e);
            return;
        }
    };
    let outcome = sandbox
        .run(Language::Bash, "cat /proc/net/dev", &ResourceLimits::default())
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, Some(0), "stderr: {}", outcome.stderr);

    let interfaces: Vec<&str> = outcome
        .stdout
        .lines()
        .skip(2)
        .filter_map(|line| line.split(':').next())
        .map(str::trim)
        .collect();
    assert_eq!(interfaces, vec!["lo"]);
}

#[tokio::test]
async fn concurrent_jobs_do_not_share_workspaces() {
    if !has("bash") {
        return;
    }
    let service = local_service(10).await;
    let gateway = service.gateway();
    let job = |tag: &str| format!("echo {} > mine.txt; sleep 1; ls; cat mine.txt; pwd", tag);

    let (first, second) = tokio::join!(
        gateway.execute(job("alpha"), Language::Bash),
        gateway.execute(job("beta"), Language::Bash),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    let lines = |output: &str| output.lines().map(str::to_string).collect::<Vec<_>>();
    let (first, second) = (lines(&first.output), lines(&second.output));
    assert_eq!(first[..3], ["main.sh", "mine.txt", "alpha"]);
    assert_eq!(second[..3], ["main.sh", "mine.txt", "beta"]);
    assert_ne!(first[3], second[3], "both jobs ran in the same directory");
    service.shutdown().await;
}
