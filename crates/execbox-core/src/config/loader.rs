//! Configuration loader for YAML files and environment overrides
//!
//! Precedence, lowest first: built-in defaults, the YAML file, `EXECBOX_*`
//! environment variables. Command-line flags are applied on top by the binary.

use std::env;
use std::path::Path;

use tokio::fs;

use crate::config::types::*;
use crate::errors::ExecError;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file, then apply environment overrides and validate.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<ExecboxConfig, ExecError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            ExecError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_str(&content)
    }

    /// Like [`ConfigLoader::from_file`], but a missing file means built-in defaults.
    pub async fn from_file_or_default<P: AsRef<Path>>(path: P) -> Result<ExecboxConfig, ExecError> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::from_file(path).await
        } else {
            log::info!(
                "Config file {} not found, using built-in defaults",
                path.display()
            );
            let mut config = ExecboxConfig::default();
            Self::apply_env_overrides(&mut config)?;
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from a YAML string, then apply environment overrides and validate.
    pub fn from_str(content: &str) -> Result<ExecboxConfig, ExecError> {
        let mut config = Self::parse(content)?;
        Self::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML only; no environment lookups, no validation.
    pub fn parse(content: &str) -> Result<ExecboxConfig, ExecError> {
        if content.trim().is_empty() {
            return Ok(ExecboxConfig::default());
        }
        serde_yaml::from_str(content)
            .map_err(|e| ExecError::Config(format!("Failed to parse YAML config: {}", e)))
    }

    pub fn apply_env_overrides(config: &mut ExecboxConfig) -> Result<(), ExecError> {
        Self::apply_overrides(config, |key| env::var(key).ok())
    }

    /// Apply overrides from any key lookup; `lookup` returns `None` for unset keys.
    pub fn apply_overrides<F>(config: &mut ExecboxConfig, lookup: F) -> Result<(), ExecError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        // Legacy toggle kept for existing deployments
        if let Some(value) = get("DOCKER_SANDBOX") {
            config.execution.backend = if parse_bool("DOCKER_SANDBOX", &value)? {
                SandboxBackend::Docker
            } else {
                SandboxBackend::Local
            };
        }
        if let Some(value) = get("EXECBOX_BACKEND") {
            config.execution.backend = value.parse()?;
        }
        if let Some(value) = get("EXECBOX_WORKERS") {
            config.execution.workers = parse_number("EXECBOX_WORKERS", &value)?;
        }
        if let Some(value) = get("EXECBOX_TIMEOUT_SECS") {
            config.execution.timeout_secs = parse_number("EXECBOX_TIMEOUT_SECS", &value)?;
            // Keep the request wait window ahead of the sandbox deadline
            if config.execution.wait_timeout_secs < config.execution.timeout_secs {
                config.execution.wait_timeout_secs = config.execution.timeout_secs.saturating_add(5);
            }
        }
        if let Some(value) = get("EXECBOX_MEMORY_MB") {
            config.execution.memory_mb = parse_number("EXECBOX_MEMORY_MB", &value)?;
        }
        if let Some(value) = get("EXECBOX_CPUS") {
            config.execution.cpus = parse_number("EXECBOX_CPUS", &value)?;
        }
        if let Some(value) = get("EXECBOX_NETWORK_ISOLATION") {
            config.execution.network_isolation = parse_bool("EXECBOX_NETWORK_ISOLATION", &value)?;
        }
        if let Some(value) = get("EXECBOX_BIND_ADDR") {
            config.server.bind_addr = value;
        }
        if let Some(value) = get("EXECBOX_COMPLETION_ENDPOINT") {
            config.completion.endpoint = Some(value);
        }
        if let Some(value) = get("EXECBOX_LOG_LEVEL") {
            config.logging.level = value;
        }

        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ExecError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ExecError::Config(format!(
            "{} must be a boolean (1/0, true/false), got '{}'",
            key, value
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ExecError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ExecError::Config(format!("{} has invalid value '{}': {}", key, value, e)))
}
