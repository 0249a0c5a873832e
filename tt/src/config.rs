//! TripTrack configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scheduler::WorkerConfig;

/// Main TripTrack configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Trip data provider
    pub provider: ProviderConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Job worker
    pub worker: WorkerConfig,

    /// Poll timing
    pub tracking: TrackingConfig,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            return Err(eyre::eyre!("worker.concurrency must be at least 1"));
        }
        if self.worker.max_attempts == 0 {
            return Err(eyre::eyre!("worker.max-attempts must be at least 1"));
        }
        if self.provider.base_url.trim().is_empty() {
            return Err(eyre::eyre!("provider.base-url must not be empty"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: .triptrack.yml
        let local_config = PathBuf::from(".triptrack.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/triptrack/triptrack.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("triptrack").join("triptrack.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Errors are swallowed: a broken config file is reported later by `load`.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => {
                let mut paths = vec![PathBuf::from(".triptrack.yml")];
                if let Some(config_dir) = dirs::config_dir() {
                    paths.push(config_dir.join("triptrack").join("triptrack.yml"));
                }
                paths
            }
        };

        candidates
            .iter()
            .filter(|path| path.exists())
            .find_map(|path| Self::load_from_file(path).ok())
            .and_then(|config| config.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Trip data provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// User-Agent header sent with every request
    #[serde(rename = "user-agent")]
    pub user_agent: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://start.vag.de/dm/api/v1".to_string(),
            timeout_ms: 10_000,
            user_agent: format!("triptrack/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path
    #[serde(rename = "db-path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = dirs::data_dir()
            .map(|d| d.join("triptrack").join("triptrack.db"))
            .unwrap_or_else(|| PathBuf::from(".triptrack").join("triptrack.db"));
        Self {
            db_path: db_path.to_string_lossy().into_owned(),
        }
    }
}

impl StorageConfig {
    /// Database path with a leading `~/` expanded
    pub fn db_path(&self) -> PathBuf {
        match (self.db_path.strip_prefix("~/"), dirs::home_dir()) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(&self.db_path),
        }
    }
}

/// Poll timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Added to the next stop's arrival before polling again
    #[serde(rename = "poll-buffer-ms")]
    pub poll_buffer_ms: u64,

    /// Delay used when the next stop has no usable time
    #[serde(rename = "fallback-poll-ms")]
    pub fallback_poll_ms: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            poll_buffer_ms: crate::tracker::DEFAULT_POLL_BUFFER_MS,
            fallback_poll_ms: crate::tracker::DEFAULT_FALLBACK_POLL_MS,
        }
    }
}

impl TrackingConfig {
    pub fn poll_buffer(&self) -> Duration {
        Duration::from_millis(self.poll_buffer_ms)
    }

    pub fn fallback_poll(&self) -> Duration {
        Duration::from_millis(self.fallback_poll_ms)
    }
}
