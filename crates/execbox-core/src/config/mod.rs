//! Configuration for the execution service
//!
//! A single YAML file with `server`, `execution`, `completion` and `logging`
//! sections. Every field has a default and most of them can be overridden from
//! the environment.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;


use crate::errors::ExecError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<ExecboxConfig, ExecError> {
    ConfigLoader::from_file(path).await
}
