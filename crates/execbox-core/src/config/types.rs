//! Configuration type definitions for the execution service
//!
//! Every section has defaults, so an empty YAML document is a valid
//! configuration. Values that are cheap to get wrong and expensive at runtime
//! (pool size against memory, request wait against sandbox timeout) are
//! checked in [`ExecboxConfig::validate`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::errors::ExecError;
use crate::executors::{Language, ResourceLimits};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecboxConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_true")]
    pub enable_cors: bool,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default = "default_true")]
    pub enable_logging: bool,
}

/// Sandbox runtime used for every job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    #[default]
    Docker,
    Local,
}

impl std::str::FromStr for SandboxBackend {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(SandboxBackend::Docker),
            "local" | "host" => Ok(SandboxBackend::Local),
            other => Err(ExecError::Config(format!("Unknown sandbox backend: {}", other))),
        }
    }
}

/// Worker pool, resource ceilings and language set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub backend: SandboxBackend,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    #[serde(default = "default_true")]
    pub network_isolation: bool,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,
    /// Seconds a finished job stays retrievable; 0 keeps jobs forever.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_languages")]
    pub languages: Vec<Language>,
    #[serde(default)]
    pub images: HashMap<Language, String>,
}

impl ExecutionConfig {
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            timeout: Duration::from_secs(self.timeout_secs),
            memory_mb: self.memory_mb,
            cpus: self.cpus,
            pids_limit: self.pids_limit,
            network_disabled: self.network_isolation,
            max_output_bytes: self.max_output_bytes,
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn retention(&self) -> Option<Duration> {
        (self.retention_secs > 0).then(|| Duration::from_secs(self.retention_secs))
    }
}

/// External suggestion provider (OpenAI-compatible chat completions)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_completion_api_key_env")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_completion_max_tokens")]
    pub max_tokens: u32,
}

impl CompletionConfig {
    /// Explicit key first, then the configured environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_ref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|key| !key.is_empty())
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_true() -> bool { true }
fn default_bind_addr() -> String { "127.0.0.1:8000".to_string() }
fn default_max_body_size() -> usize { 1024 * 1024 }
fn default_workers() -> usize { 4 }
fn default_timeout_secs() -> u64 { 30 }
fn default_wait_timeout_secs() -> u64 { 35 }
fn default_memory_mb() -> u64 { 128 }
fn default_cpus() -> f64 { 0.5 }
fn default_pids_limit() -> i64 { 64 }
fn default_max_output_bytes() -> usize { 1024 * 1024 }
fn default_max_code_bytes() -> usize { 256 * 1024 }
fn default_retention_secs() -> u64 { 3600 }
fn default_languages() -> Vec<Language> { Language::ALL.to_vec() }
fn default_completion_model() -> String { "gpt-4o-mini".to_string() }
fn default_completion_api_key_env() -> Option<String> { Some("OPENAI_API_KEY".to_string()) }
fn default_completion_timeout_secs() -> u64 { 6 }
fn default_completion_max_tokens() -> u32 { 128 }
fn default_log_level() -> String { "info".to_string() }

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            enable_cors: true,
            cors_origins: Vec::new(),
            max_body_size: default_max_body_size(),
            enable_logging: true,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::default(),
            workers: default_workers(),
            timeout_secs: default_timeout_secs(),
            wait_timeout_secs: default_wait_timeout_secs(),
            memory_mb: default_memory_mb(),
            cpus: default_cpus(),
            pids_limit: default_pids_limit(),
            network_isolation: true,
            max_output_bytes: default_max_output_bytes(),
            max_code_bytes: default_max_code_bytes(),
            retention_secs: default_retention_secs(),
            languages: default_languages(),
            images: HashMap::new(),
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: default_completion_model(),
            api_key: None,
            api_key_env: default_completion_api_key_env(),
            timeout_secs: default_completion_timeout_secs(),
            max_tokens: default_completion_max_tokens(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ExecboxConfig {
    pub fn validate(&self) -> Result<(), ExecError> {
        self.server
            .bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| {
                ExecError::Config(format!("Invalid bind address '{}': {}", self.server.bind_addr, e))
            })?;

        let exec = &self.execution;
        if exec.workers == 0 {
            return Err(ExecError::Config("execution.workers must be greater than 0".to_string()));
        }
        if exec.timeout_secs == 0 {
            return Err(ExecError::Config("execution.timeout_secs must be greater than 0".to_string()));
        }
        if exec.wait_timeout_secs < exec.timeout_secs {
            return Err(ExecError::Config(format!(
                "execution.wait_timeout_secs ({}) must be at least execution.timeout_secs ({})",
                exec.wait_timeout_secs, exec.timeout_secs
            )));
        }
        // Docker refuses memory limits below 6 MB
        if exec.memory_mb < 6 {
            return Err(ExecError::Config("execution.memory_mb must be at least 6".to_string()));
        }
        if !(exec.cpus > 0.0) {
            return Err(ExecError::Config("execution.cpus must be greater than 0".to_string()));
        }
        if exec.pids_limit <= 0 {
            return Err(ExecError::Config("execution.pids_limit must be greater than 0".to_string()));
        }
        if exec.languages.is_empty() {
            return Err(ExecError::Config("execution.languages cannot be empty".to_string()));
        }
        if exec.max_code_bytes == 0 || exec.max_output_bytes == 0 {
            return Err(ExecError::Config(
                "execution.max_code_bytes and execution.max_output_bytes must be greater than 0"
                    .to_string(),
            ));
        }

        if let Some(endpoint) = &self.completion.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(ExecError::Config(format!(
                    "completion.endpoint must be an http(s) URL, got '{}'",
                    endpoint
                )));
            }
        }
        if self.completion.timeout_secs == 0 {
            return Err(ExecError::Config("completion.timeout_secs must be greater than 0".to_string()));
        }

        Ok(())
    }
}
