use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ExecutorError, ExecutorResult};

pub(crate) const DEFAULT_TOTAL_UNITS: u32 = 4;
pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// What to do with a sandbox directory after its process terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Delete the sandbox unconditionally.
    #[default]
    Never,
    /// Keep the sandbox when the process exits nonzero or times out.
    OnFailure,
    /// Keep every sandbox.
    Always,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Size of the concurrency unit pool (typically the core count).
    #[serde(default = "default_total_units")]
    pub total_units: u32,
    /// Directory sandboxes are created under.
    pub sandbox_root: PathBuf,
    #[serde(default)]
    pub sandboxer: SandboxerConfig,
    #[serde(default)]
    pub keep_sandboxes: RetentionPolicy,
    /// Default wall-clock limit for a process, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxerConfig {
    /// Route materialization through the sidecar process instead of
    /// writing files in-process.
    pub enabled: bool,
    /// Unix socket the sidecar listens on. Required when enabled.
    pub socket: Option<PathBuf>,
}

fn default_total_units() -> u32 {
    DEFAULT_TOTAL_UNITS
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Load and validate an executor config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> ExecutorResult<ExecutorConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ExecutorError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: ExecutorConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| ExecutorError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

impl ExecutorConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.sandbox_root);
        if let Some(socket) = &mut self.sandboxer.socket {
            resolve(socket);
        }
    }

    pub fn validate(&self) -> ExecutorResult<()> {
        if self.total_units == 0 {
            return Err(ExecutorError::Config(
                "total_units must be at least 1".into(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ExecutorError::Config(
                "timeout_secs must be at least 1".into(),
            ));
        }
        if self.sandboxer.enabled && self.sandboxer.socket.is_none() {
            return Err(ExecutorError::Config(
                "sandboxer.socket is required when sandboxer.enabled is true".into(),
            ));
        }
        Ok(())
    }
}
