mod logging_config;

use dimse::{DimseConfig, RemoteNode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub use logging_config::{init_logging, LoggingConfig};

/// Errors raised while loading or validating the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid [{section}] configuration: {message}")]
    Invalid { section: &'static str, message: String },

    #[error("failed to initialise logging: {0}")]
    Logging(String),
}

impl ConfigError {
    fn invalid(section: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            section,
            message: message.into(),
        }
    }
}

/// Application configuration, read from a TOML file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub dimse: DimseConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Default remote node for `send`
    #[serde(default)]
    pub remote: Option<RemoteNode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppSection {
    /// Where projects live; defaults to `~/.dcmcat`
    pub home_dir: Option<PathBuf>,
    /// Catalog used by `index`, `query` and `send`; defaults to `<home>/catalog.redb`
    pub catalog_path: Option<PathBuf>,
}

impl AppSection {
    pub fn home_dir(&self) -> PathBuf {
        self.home_dir.clone().unwrap_or_else(default_home_dir)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| self.home_dir().join("catalog.redb"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_retrieval_workers")]
    pub workers: usize,
    /// Time allowed for in-flight C-STORE pushes after the last C-MOVE completes
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_receiver_ready_timeout_ms")]
    pub receiver_ready_timeout_ms: u64,
    /// Archive each received subject directory as tar.gz
    #[serde(default)]
    pub compress: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            workers: default_retrieval_workers(),
            grace_period_secs: default_grace_period_secs(),
            receiver_ready_timeout_ms: default_receiver_ready_timeout_ms(),
            compress: false,
        }
    }
}

impl RetrievalConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.receiver_ready_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_scan_workers")]
    pub workers: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: default_scan_workers(),
        }
    }
}

impl AppConfig {
    /// Load the configuration; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// `~/.dcmcat/config.toml`
    pub fn default_path() -> PathBuf {
        default_home_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dimse
            .validate()
            .map_err(|e| ConfigError::invalid("dimse", e.to_string()))?;
        if self.retrieval.workers == 0 {
            return Err(ConfigError::invalid("retrieval", "workers must be at least 1"));
        }
        if self.scan.workers == 0 {
            return Err(ConfigError::invalid("scan", "workers must be at least 1"));
        }
        if let Some(remote) = &self.remote {
            remote
                .validate()
                .map_err(|e| ConfigError::invalid("remote", e.to_string()))?;
        }
        self.logging.validate()?;
        Ok(())
    }
}

fn default_home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dcmcat")
}

fn default_retrieval_workers() -> usize {
    4
}

fn default_grace_period_secs() -> u64 {
    10
}

fn default_receiver_ready_timeout_ms() -> u64 {
    5000
}

fn default_scan_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
