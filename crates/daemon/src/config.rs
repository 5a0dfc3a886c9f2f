// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration: TOML file plus environment overrides.

use driftd_core::{TriggerPolicy, WorkerConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "DRIFTD_CONFIG";

/// Environment override for the KV URL.
pub const REDIS_URL_ENV: &str = "DRIFTD_REDIS_URL";

/// Default config file, consulted when `DRIFTD_CONFIG` is unset.
const DEFAULT_CONFIG_PATH: &str = "driftd.toml";

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error(transparent)]
    Invalid(#[from] driftd_core::ConfigError),
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_runner_program() -> String {
    "terraform".to_string()
}

fn default_runner_args() -> Vec<String> {
    vec![
        "plan".to_string(),
        "-detailed-exitcode".to_string(),
        "-no-color".to_string(),
    ]
}

fn default_concurrency() -> usize {
    4
}

fn default_lock_ttl_secs() -> u64 {
    300
}

fn default_renew_every_secs() -> u64 {
    60
}

fn default_scan_max_age_secs() -> u64 {
    2 * 60 * 60
}

fn default_stack_timeout_secs() -> u64 {
    30 * 60
}

fn default_recovery_interval_secs() -> u64 {
    60
}

fn default_metrics_poll_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct WorkerSection {
    concurrency: usize,
    lock_ttl_secs: u64,
    renew_every_secs: u64,
    scan_max_age_secs: u64,
    stack_timeout_secs: u64,
    retry_once: bool,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            lock_ttl_secs: default_lock_ttl_secs(),
            renew_every_secs: default_renew_every_secs(),
            scan_max_age_secs: default_scan_max_age_secs(),
            stack_timeout_secs: default_stack_timeout_secs(),
            retry_once: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RunnerSection {
    program: String,
    args: Vec<String>,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            program: default_runner_program(),
            args: default_runner_args(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    #[serde(default = "default_redis_url")]
    redis_url: String,
    /// Log file; absent means stderr.
    log_path: Option<PathBuf>,
    #[serde(default = "default_recovery_interval_secs")]
    recovery_interval_secs: u64,
    #[serde(default = "default_metrics_poll_secs")]
    metrics_poll_secs: u64,
    worker: WorkerSection,
    runner: RunnerSection,
    trigger: TriggerPolicy,
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub log_path: Option<PathBuf>,
    pub recovery_interval: Duration,
    pub metrics_poll: Duration,
    pub worker: WorkerConfig,
    pub runner_program: String,
    pub runner_args: Vec<String>,
    pub trigger_policy: TriggerPolicy,
}

impl Config {
    /// Load from `DRIFTD_CONFIG` (or `./driftd.toml` when present, else
    /// defaults), apply environment overrides, and validate.
    pub fn load() -> Result<Self, ConfigFileError> {
        let file = match std::env::var(CONFIG_ENV) {
            Ok(path) => read_file(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                read_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            Err(_) => FileConfig::default_with_serde(),
        };
        Self::from_file(file)
    }

    /// Load from a specific file (tests, `--config` style wrappers).
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        Self::from_file(read_file(path)?)
    }

    fn from_file(mut file: FileConfig) -> Result<Self, ConfigFileError> {
        if let Ok(url) = std::env::var(REDIS_URL_ENV) {
            file.redis_url = url;
        }

        let worker = WorkerConfig {
            concurrency: file.worker.concurrency,
            lock_ttl: Duration::from_secs(file.worker.lock_ttl_secs),
            renew_every: Duration::from_secs(file.worker.renew_every_secs),
            scan_max_age: Duration::from_secs(file.worker.scan_max_age_secs),
            stack_timeout: Duration::from_secs(file.worker.stack_timeout_secs),
            retry_once: file.worker.retry_once,
        };
        worker.validate()?;

        Ok(Self {
            redis_url: file.redis_url,
            log_path: file.log_path,
            recovery_interval: Duration::from_secs(file.recovery_interval_secs),
            metrics_poll: Duration::from_secs(file.metrics_poll_secs),
            worker,
            runner_program: file.runner.program,
            runner_args: file.runner.args,
            trigger_policy: file.trigger,
        })
    }
}

impl FileConfig {
    /// `Default` with the serde field defaults applied (the `#[serde(default
    /// = ...)]` functions are invisible to `derive(Default)`).
    fn default_with_serde() -> Self {
        Self {
            redis_url: default_redis_url(),
            recovery_interval_secs: default_recovery_interval_secs(),
            metrics_poll_secs: default_metrics_poll_secs(),
            ..Self::default()
        }
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigFileError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Io {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigFileError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
