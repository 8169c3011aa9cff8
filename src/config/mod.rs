//! Configuration module
//!
//! Handles loading and managing configuration. Values are layered file,
//! then environment, then command-line flags.

pub mod env;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::discovery::DEFAULT_PATTERN;
use crate::executor::{PoolSize, RunOptions, DEFAULT_GRACE_PERIOD};
use crate::pool::{WorkerCommand, DEFAULT_STARTUP_TIMEOUT};

pub use env::EnvConfig;

/// Project-local configuration file name
pub const LOCAL_CONFIG: &str = "verdant.yaml";

/// Runner configuration as stored on disk
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    /// Worker count, a number or "auto"
    pub processes: PoolSize,

    /// Item-id filter
    pub filter: Option<String>,

    /// Let item output reach the terminal instead of capturing it
    pub allow_output: bool,

    pub initializer: Option<String>,
    pub finalizer: Option<String>,

    pub coverage: bool,
    pub coverage_dir: Option<PathBuf>,

    /// Seconds in-flight tasks get after the first interrupt
    pub grace_secs: u64,

    /// File-name glob for suite files
    pub pattern: String,

    /// Extra roots for resolving dotted targets
    pub search_paths: Vec<PathBuf>,

    /// Directory targets are resolved against
    pub base_dir: Option<PathBuf>,

    /// Executable started as `<program> worker`
    pub worker_program: Option<PathBuf>,

    /// Per-case timeout when the case sets none
    pub default_timeout_secs: Option<u64>,

    pub startup_timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            processes: PoolSize::Auto,
            filter: None,
            allow_output: false,
            initializer: None,
            finalizer: None,
            coverage: false,
            coverage_dir: None,
            grace_secs: DEFAULT_GRACE_PERIOD.as_secs(),
            pattern: DEFAULT_PATTERN.to_string(),
            search_paths: Vec::new(),
            base_dir: None,
            worker_program: None,
            default_timeout_secs: None,
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT.as_secs(),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Find the configuration file to use
    ///
    /// An explicit path wins, then `VERDANT_CONFIG`, then [`LOCAL_CONFIG`] in
    /// the current directory, then the user configuration directory.
    pub fn locate(explicit: Option<&Path>, env: &EnvConfig) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Some(path) = &env.config_file {
            return Some(PathBuf::from(path));
        }
        let local = PathBuf::from(LOCAL_CONFIG);
        if local.is_file() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("verdant").join("config.yaml"))
            .filter(|path| path.is_file())
    }

    /// Located file layered with the environment
    pub fn resolve(explicit: Option<&Path>, env: &EnvConfig) -> Result<Self> {
        let mut config = match Self::locate(explicit, env) {
            Some(path) => {
                debug!("Using config file {}", path.display());
                Self::load(&path)?
            }
            None => Self::default(),
        };
        if env.has_any() {
            debug!("Applying environment overrides: {:?}", env);
        }
        config.apply_env(env);
        Ok(config)
    }

    /// Environment values replace file values
    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(processes) = env.processes {
            self.processes = processes;
        }
        if let Some(filter) = &env.filter {
            self.filter = Some(filter.clone());
        }
        if let Some(allow) = env.passthrough {
            self.allow_output = allow;
        }
        if let Some(coverage) = env.coverage {
            self.coverage = coverage;
        }
        if let Some(initializer) = &env.initializer {
            self.initializer = Some(initializer.clone());
        }
        if let Some(finalizer) = &env.finalizer {
            self.finalizer = Some(finalizer.clone());
        }
        if let Some(grace) = env.grace {
            self.grace_secs = grace;
        }
    }

    pub fn to_run_options(&self) -> RunOptions {
        RunOptions {
            pool_size: self.processes,
            name_filter: self.filter.clone(),
            allow_output_passthrough: self.allow_output,
            initializer: self.initializer.clone(),
            finalizer: self.finalizer.clone(),
            coverage_enabled: self.coverage,
            coverage_dir: self.coverage_dir.clone(),
            grace_period: Duration::from_secs(self.grace_secs),
            discovery_pattern: self.pattern.clone(),
            search_paths: self.search_paths.clone(),
            base_dir: self.base_dir.clone().unwrap_or_else(|| PathBuf::from(".")),
            worker_program: self.worker_program.as_ref().map(WorkerCommand::new),
            default_timeout_secs: self.default_timeout_secs,
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
        }
    }
}

/// Check if file is YAML based on extension
fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}
