//! Command-line entry point for the execbox code execution service
//!
//! `run` (the default) loads the configuration, starts the worker pool on the
//! selected sandbox backend and serves the HTTP API until Ctrl+C or SIGTERM.
//! `smoke` checks a running server by executing a hello-world program in every
//! language it has enabled.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use execbox_core::config::{ConfigLoader, ExecboxConfig, SandboxBackend};
use execbox_core::{ExecutionService, Language};
use execbox_http::{shutdown_signal, ExecServer, ServerConfig};
use log::LevelFilter;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about = "execbox - run untrusted code in resource-bounded sandboxes")]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(long, short, global = true, default_value = "execbox.yaml", help = "Path to the YAML configuration; defaults apply when the file is missing")]
    config: String,

    #[clap(long, global = true, help = "Override server.bind_addr")]
    bind_addr: Option<String>,

    #[clap(long, short, global = true, help = "Log level (error, warn, info, debug, trace); overrides logging.level")]
    log_level: Option<String>,

    #[clap(long, global = true, help = "Override execution.workers")]
    workers: Option<usize>,

    #[clap(long, global = true, help = "Sandbox backend: docker or local")]
    backend: Option<SandboxBackend>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the execution server (default command)
    Run,
    /// Execute a hello-world program per enabled language against a running server
    Smoke {
        #[clap(long, default_value = "http://127.0.0.1:8000")]
        base_url: String,

        #[clap(long, default_value = "180", help = "Per-request timeout in seconds; first runs may pull images")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_found = Path::new(&cli.config).exists();
    let config = load_config(&cli).await?;

    // Initialize logger
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let log_level_filter = level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    if config_found {
        log::info!("Loaded configuration from {}", cli.config);
    } else {
        log::info!("No configuration at {}; using defaults", cli.config);
    }

    match cli.command {
        Some(Commands::Smoke {
            base_url,
            timeout_secs,
        }) => run_smoke(&base_url, Duration::from_secs(timeout_secs)).await,
        Some(Commands::Run) | None => run_server(config).await,
    }
}

/// File (or defaults), then environment, then command-line flags, then validation.
async fn load_config(cli: &Cli) -> Result<ExecboxConfig> {
    let mut config = ConfigLoader::from_file_or_default(&cli.config)
        .await
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;

    if let Some(bind_addr) = &cli.bind_addr {
        config.server.bind_addr = bind_addr.clone();
    }
    if let Some(workers) = cli.workers {
        config.execution.workers = workers;
    }
    if let Some(backend) = cli.backend {
        config.execution.backend = backend;
    }
    config.validate()?;
    Ok(config)
}

async fn run_server(config: ExecboxConfig) -> Result<()> {
    let server_config = ServerConfig::from_settings(&config.server)?;
    let service = ExecutionService::start(&config)
        .await
        .context("Failed to start the execution service")?;

    log::info!(
        "Starting execbox on {} with {} {} workers",
        server_config.bind_addr,
        service.workers(),
        service.backend()
    );

    let server = ExecServer::new(&service, server_config);
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    log::info!("Waiting for running jobs to finish...");
    service.shutdown().await;

    if let Err(e) = served {
        log::error!("Server failed: {}", e);
        return Err(e.into());
    }
    log::info!("execbox shut down gracefully.");
    Ok(())
}

async fn run_smoke(base_url: &str, timeout: Duration) -> Result<()> {
    let base_url = base_url.trim_end_matches('/');
    let client = reqwest::Client::builder().timeout(timeout).build()?;

    let listing: Value = client
        .get(format!("{}/languages", base_url))
        .send()
        .await
        .with_context(|| format!("execbox server not reachable at {}", base_url))?
        .error_for_status()?
        .json()
        .await?;
    let languages: Vec<Language> = listing["languages"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry["name"].as_str())
                .filter_map(|name| name.parse().ok())
                .collect()
        })
        .unwrap_or_default();
    if languages.is_empty() {
        bail!("Server at {} reports no enabled languages", base_url);
    }

    let mut failures = Vec::new();
    for language in languages {
        let response = client
            .post(format!("{}/execute", base_url))
            .json(&json!({ "code": language.smoke_program(), "language": language.name() }))
            .send()
            .await;

        let outcome = match response {
            Ok(response) => response.json::<Value>().await.map_err(anyhow::Error::from),
            Err(e) => Err(e.into()),
        };
        match outcome.map(|body| verdict(&body)) {
            Ok(Verdict::Passed(output)) => {
                println!("[ok]   {:<10} {}", language.name(), output.trim());
            }
            Ok(Verdict::Pending(job_id)) => {
                println!(
                    "[wait] {:<10} still running as job {}; poll /result/{}",
                    language.name(),
                    job_id,
                    job_id
                );
                failures.push(language);
            }
            Ok(Verdict::Failed(detail)) => {
                println!("[fail] {:<10} {}", language.name(), detail.trim());
                failures.push(language);
            }
            Err(e) => {
                println!("[fail] {:<10} request failed: {}", language.name(), e);
                failures.push(language);
            }
        }
    }

    if !failures.is_empty() {
        let names: Vec<&str> = failures.iter().map(|l| l.name()).collect();
        bail!("Smoke check did not pass for: {}", names.join(", "));
    }
    println!("All languages passed.");
    Ok(())
}

#[derive(Debug, PartialEq)]
enum Verdict {
    Passed(String),
    /// `/execute` gave up waiting; the job keeps running server-side
    Pending(String),
    Failed(String),
}

fn verdict(body: &Value) -> Verdict {
    if body["success"] == true {
        return Verdict::Passed(body["output"].as_str().unwrap_or_default().to_string());
    }
    if body["pending"] == true {
        return Verdict::Pending(body["job_id"].as_str().unwrap_or("unknown").to_string());
    }
    let detail = body["error"]
        .as_str()
        .filter(|error| !error.is_empty())
        .or_else(|| body["details"].as_str())
        .unwrap_or("no output");
    Verdict::Failed(detail.to_string())
}
