//! Service configuration, loaded from a single TOML file.
//!
//! ## Example
//!
//! ```toml
//! [service]
//! log_level = "debug"
//!
//! [storage]
//! uploads_dir = "/srv/plotq/uploads"
//! database_path = "/srv/plotq/jobs.db"
//!
//! [device]
//! program = "axicli"
//! args = []
//!
//! [queue]
//! max_queue_size = 50
//! orphan_policy = "fail"
//!
//! [api]
//! bind = "127.0.0.1:8080"
//! api_key = "change-me"
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const API_KEY_ENV: &str = "PLOTQ_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// One of trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploads_dir: default_uploads_dir(),
            database_path: default_database_path(),
        }
    }
}

/// How the external drawing tool is invoked. Plot flags and the input path are
/// appended after `args`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_program_args")]
    pub args: Vec<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Time between the graceful stop signal and the forced kill.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_program_args(),
            model: default_model(),
            probe_timeout_secs: default_probe_timeout_secs(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

impl DeviceConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// What to do at startup with jobs left `running` by a previous process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Mark them failed.
    #[default]
    Fail,
    /// Leave them as they are.
    Keep,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default)]
    pub orphan_policy: OrphanPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            poll_interval_secs: default_poll_interval_secs(),
            max_file_size_mb: default_max_file_size_mb(),
            orphan_policy: OrphanPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_file_size_bytes(&self) -> usize {
        (self.max_file_size_mb as usize).saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// When set, every request must carry it in `X-API-Key`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub rate_limit_enabled: bool,
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            prefix: default_prefix(),
            api_key: None,
            rate_limit_enabled: true,
            rate_limit_requests: default_rate_limit_requests(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.program.trim().is_empty() {
            return Err(ConfigError::Invalid("device.program must not be empty".to_string()));
        }
        if self.queue.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("queue.poll_interval_secs must be > 0".to_string()));
        }
        if self.queue.max_queue_size == 0 {
            return Err(ConfigError::Invalid("queue.max_queue_size must be > 0".to_string()));
        }
        if self.api.rate_limit_enabled && self.api.rate_limit_requests == 0 {
            return Err(ConfigError::Invalid("api.rate_limit_requests must be > 0".to_string()));
        }
        if self.api.rate_limit_enabled && self.api.rate_limit_window_secs == 0 {
            return Err(ConfigError::Invalid("api.rate_limit_window_secs must be > 0".to_string()));
        }
        if !self.api.prefix.is_empty() && !self.api.prefix.starts_with('/') {
            return Err(ConfigError::Invalid(format!("api.prefix '{}' must start with '/'", self.api.prefix)));
        }
        Ok(())
    }

    /// Applies `PLOTQ_API_KEY` on top of the file contents.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                self.api.api_key = Some(key);
            }
        }
    }
}

fn default_service_name() -> String { "Plotter Queue Service".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_uploads_dir() -> PathBuf { PathBuf::from("/data/uploads") }
fn default_database_path() -> PathBuf { PathBuf::from("/data/jobs.db") }
fn default_program() -> String { "python".to_string() }
fn default_program_args() -> Vec<String> { vec!["-m".to_string(), "axicli".to_string()] }
fn default_model() -> String { "AxiDraw".to_string() }
fn default_probe_timeout_secs() -> u64 { 5 }
fn default_grace_period_secs() -> u64 { 5 }
fn default_max_queue_size() -> usize { 100 }
fn default_poll_interval_secs() -> u64 { 5 }
fn default_max_file_size_mb() -> u64 { 10 }
fn default_bind() -> String { "0.0.0.0:8080".to_string() }
fn default_prefix() -> String { "/api".to_string() }
fn default_true() -> bool { true }
fn default_rate_limit_requests() -> u32 { 100 }
fn default_rate_limit_window_secs() -> u64 { 60 }

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path.display(), e);
            Err(ConfigError::Io(e))
        }
    }
}
