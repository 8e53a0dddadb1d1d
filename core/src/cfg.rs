use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"local"`.
    pub organization: &'static str,
    /// Application name, e.g. `"jobqd"`.
    pub application: &'static str,
}

/// Application configuration persisted to `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Store location; defaults to the per-app data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Queue and retry settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Daemon scheduling periods.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// HTTP control plane.
    #[serde(default)]
    pub web: WebConfig,
}

/// Settings consumed by [`crate::manager::JobManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Retry ceiling for jobs created without an explicit one.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Retry delay table in seconds, indexed by the current retry count.
    #[serde(default = "default_retry_delays")]
    pub retry_delays_secs: Vec<u64>,
    /// Maximum number of persisted log entries (oldest dropped first).
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    /// Age in days after which terminal jobs are swept.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

/// Periods for the daemon's scheduler and sweeper modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between pending-job passes (ms).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Interval between retention sweeps (ms).
    #[serde(default = "default_cleanup_every_ms")]
    pub cleanup_every_ms: u64,
}

/// HTTP control plane settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebConfig {
    /// Listen address, e.g. `"127.0.0.1:8787"`. Disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_addr: Option<String>,
}

fn default_log_level() -> String { "info".to_string() }
fn default_max_retries() -> u32 { 3 }
fn default_retry_delays() -> Vec<u64> { vec![60, 300, 900, 1800, 3600] }
fn default_log_capacity() -> usize { 1000 }
fn default_retention_days() -> u32 { 7 }
fn default_tick_ms() -> u64 { 30_000 }
fn default_cleanup_every_ms() -> u64 { 3_600_000 }

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: None,
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            retry_delays_secs: default_retry_delays(),
            log_capacity: default_log_capacity(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_ms: default_tick_ms(), cleanup_every_ms: default_cleanup_every_ms() }
    }
}

impl QueueConfig {
    /// Build the retry policy described by `retry_delays_secs`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_delays_secs.iter().map(|s| Duration::from_secs(*s)).collect())
    }
}

fn project_dirs(app: &AppId) -> Result<ProjectDirs> {
    ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let dir = project_dirs(app)?.config_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Resolve the store directory: `cfg.data_dir` if set, else the app data dir.
pub fn data_dir(app: &AppId, cfg: &Config) -> Result<PathBuf> {
    let dir = match &cfg.data_dir {
        Some(d) => PathBuf::from(d),
        None => project_dirs(app)?.data_dir().join("store"),
    };
    fs::create_dir_all(&dir).with_context(|| format!("create data dir {}", dir.display()))?;
    Ok(dir)
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<Config> {
    let path = config_dir(app)?.join("config.toml");
    if path.exists() {
        load_from(&path)
    } else {
        let cfg = Config::default();
        save_config(&path, &cfg)?;
        Ok(cfg)
    }
}

/// Load a config file from an explicit path.
pub fn load_from(path: &Path) -> Result<Config> {
    let txt = fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    let cfg: Config = toml::from_str(&txt)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg)
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
