//! Configuration loading
//!
//! Resolution priority for the config file path:
//! 1. `TRACKECO_CONFIG` environment variable
//! 2. `~/.config/trackeco/config.toml` (user) then `/etc/trackeco/config.toml` (system)
//! 3. Compiled defaults (no file required)

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level worker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database path
    pub database_path: PathBuf,
    /// Root folder for media objects (incoming/, processed/, failed/)
    pub media_root: PathBuf,
    pub gemini: GeminiConfig,
    pub worker: WorkerConfig,
    pub endpoints: EndpointConfig,
}

/// Inference provider settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    /// Ordered credential pool; rotation wraps modulo the pool size
    pub api_keys: Vec<String>,
    pub base_url: String,
    pub model: String,
    /// Seconds between file-state polls
    pub poll_interval_secs: u64,
    /// Total polling budget before the upload is considered stuck
    pub poll_budget_secs: u64,
    pub request_timeout_secs: u64,
}

/// Queue runner settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent queue consumers
    pub concurrency: usize,
    /// Sleep between polls when the queue is empty (milliseconds)
    pub idle_poll_ms: u64,
    /// Lease duration for a claimed task; expired leases are redelivered
    pub lease_secs: i64,
    /// Attempt bound for analyze tasks (first run + retries)
    pub analyze_max_attempts: i64,
    /// Base delay before a retried task becomes runnable again
    pub retry_delay_secs: i64,
    /// UTC offset (hours) defining the local day for streak bucketing
    pub utc_offset_hours: i32,
}

/// Optional outbound endpoints; unset endpoints disable the side effect
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Push-notification delivery endpoint (FCM-style data messages)
    pub push_url: Option<String>,
    /// Search reindex endpoint, receives user summaries
    pub search_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            database_path: data_dir.join("trackeco.db"),
            media_root: data_dir.join("media"),
            gemini: GeminiConfig::default(),
            worker: WorkerConfig::default(),
            endpoints: EndpointConfig::default(),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            model: "gemini-2.5-pro".to_string(),
            poll_interval_secs: 10,
            poll_budget_secs: 300,
            request_timeout_secs: 120,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            idle_poll_ms: 500,
            lease_secs: 600,
            analyze_max_attempts: 3,
            retry_delay_secs: 300,
            // Original deployment scores days in UTC+7 (Asia/Jakarta)
            utc_offset_hours: 7,
        }
    }
}

impl Config {
    /// Load configuration following the documented resolution order
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("TRACKECO_CONFIG") {
            return Self::from_file(Path::new(&path));
        }
        if let Some(path) = find_config_file() {
            return Self::from_file(&path);
        }
        Ok(Self::default())
    }

    /// Parse configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            return Err(Error::Config("worker.concurrency must be at least 1".to_string()));
        }
        if self.gemini.poll_interval_secs == 0 {
            return Err(Error::Config("gemini.poll_interval_secs must be nonzero".to_string()));
        }
        if !(-12..=14).contains(&self.worker.utc_offset_hours) {
            return Err(Error::Config(format!(
                "worker.utc_offset_hours out of range: {}",
                self.worker.utc_offset_hours
            )));
        }
        Ok(())
    }
}

/// Locate a config file on disk, user location first
fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = dirs::config_dir() {
        let user_config = dir.join("trackeco").join("config.toml");
        if user_config.exists() {
            return Some(user_config);
        }
    }
    let system_config = PathBuf::from("/etc/trackeco/config.toml");
    if system_config.exists() {
        return Some(system_config);
    }
    None
}

/// OS-dependent default data folder
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("trackeco"))
        .unwrap_or_else(|| PathBuf::from("./trackeco_data"))
}
