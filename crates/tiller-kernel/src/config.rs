use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tiller_condenser::CondenserConfig;
use tiller_recall::RecallConfig;
use tiller_runtime::{ConfirmationPolicy, ControllerConfig, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid [{section}] config: {message}")]
    Invalid {
        section: &'static str,
        message: String,
    },
}

impl ConfigError {
    fn invalid(section: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Invalid {
            section,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DelegationConfig {
    pub max_depth: u32,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self { max_depth: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Top-level rollouts running at once. Delegated children don't count.
    pub max_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrajectoryConfig {
    pub enabled: bool,
    /// Defaults to `<root>/trajectories`.
    pub dir: Option<PathBuf>,
    /// Label used when a rollout request carries none.
    pub default_label: String,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            default_label: "default".to_owned(),
        }
    }
}

/// Everything `tillerd` reads from its TOML file. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TillerConfig {
    pub log: LogConfig,
    pub controller: ControllerConfig,
    pub retry: RetryPolicy,
    pub condenser: CondenserConfig,
    pub recall: RecallConfig,
    pub delegation: DelegationConfig,
    pub pool: PoolConfig,
    pub confirmation: ConfirmationPolicy,
    pub trajectories: TrajectoryConfig,
}

impl TillerConfig {
    pub fn from_toml(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml(&raw, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller
            .validate()
            .map_err(|error| ConfigError::invalid("controller", error))?;
        self.retry
            .validate()
            .map_err(|error| ConfigError::invalid("retry", error))?;
        self.condenser
            .validate()
            .map_err(|error| ConfigError::invalid("condenser", error))?;
        if self.recall.max_results == 0 {
            return Err(ConfigError::invalid("recall", "max_results must be at least 1"));
        }
        if self.pool.max_workers == 0 {
            return Err(ConfigError::invalid("pool", "max_workers must be at least 1"));
        }
        if self.trajectories.default_label.trim().is_empty() {
            return Err(ConfigError::invalid(
                "trajectories",
                "default_label must not be empty",
            ));
        }
        Ok(())
    }

    /// Where trajectories go when `[trajectories].dir` is unset.
    pub fn trajectory_dir(&self, root: &Path) -> PathBuf {
        self.trajectories
            .dir
            .clone()
            .unwrap_or_else(|| root.join("trajectories"))
    }
}
