//! Configuration loading for lanequeue.
//!
//! Settings are JSON files layered from a config directory, later files win:
//! - `main.json`
//! - `main.local.json`
//! - `<env>/main.json`
//! - `<env>/main.local.json`
//!
//! `<env>` comes from `LANEQUEUE_ENV` and defaults to `dev`. Missing files are
//! skipped, so an empty directory yields the defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

const ROOT_FILE: &str = "main";
const LOCAL_MARK: &str = ".local";
const EXTENSION: &str = ".json";

/// Environment variable selecting the per-environment config layer.
pub const ENV_VAR: &str = "LANEQUEUE_ENV";

/// Get the lanequeue data directory.
pub fn get_home_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "lanequeue", "lanequeue")
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(dirs.data_dir().to_path_buf())
}

/// Current environment name.
pub fn current_env() -> String {
    std::env::var(ENV_VAR)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "dev".to_string())
}

/// Load layered settings from `config_dir` for the current environment.
pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    load_settings_for_env(config_dir, &current_env())
}

/// Load layered settings from `config_dir` for `env`.
pub fn load_settings_for_env(config_dir: &Path, env: &str) -> Result<Settings> {
    let env_dir = config_dir.join(env);
    let layers = [
        config_dir.join(format!("{}{}", ROOT_FILE, EXTENSION)),
        config_dir.join(format!("{}{}{}", ROOT_FILE, LOCAL_MARK, EXTENSION)),
        env_dir.join(format!("{}{}", ROOT_FILE, EXTENSION)),
        env_dir.join(format!("{}{}{}", ROOT_FILE, LOCAL_MARK, EXTENSION)),
    ];

    let mut merged = serde_json::Value::Object(serde_json::Map::new());
    for path in &layers {
        if !path.exists() {
            continue;
        }
        let content = std::fs::read_to_string(path)?;
        let layer: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid config file {}: {}", path.display(), e)))?;
        merge_values(&mut merged, layer);
        tracing::debug!("Applied config layer {}", path.display());
    }

    let settings: Settings = serde_json::from_value(merged)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {} (env={})", config_dir.display(), env);
    Ok(settings)
}

/// Deep-merge `from` into `to`; objects merge key by key, everything else is replaced.
fn merge_values(to: &mut serde_json::Value, from: serde_json::Value) {
    match (to, from) {
        (serde_json::Value::Object(to_map), serde_json::Value::Object(from_map)) => {
            for (key, value) in from_map {
                match to_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        to_map.insert(key, value);
                    }
                }
            }
        }
        (to, from) => *to = from,
    }
}

/// Reject settings the consumer cannot run with.
pub fn validate_settings(settings: &Settings) -> Result<()> {
    let queue = &settings.queue;
    if queue.queue_name.trim().is_empty() {
        return Err(Error::Config("queue.queue_name must not be empty".to_string()));
    }
    if queue.lease_timeout_ms == 0 {
        return Err(Error::Config("queue.lease_timeout_ms must be greater than 0".to_string()));
    }
    if queue.fetch_delay_ms == 0 {
        return Err(Error::Config("queue.fetch_delay_ms must be greater than 0".to_string()));
    }
    if queue.max_in_flight == Some(0) {
        return Err(Error::Config("queue.max_in_flight must be greater than 0 when set".to_string()));
    }
    if queue.lease_timeout_ms < 1_000 {
        // Processing that outlives the lease lets a second worker take the same key.
        tracing::warn!(
            "queue.lease_timeout_ms={} is very short; messages for one key may be processed concurrently",
            queue.lease_timeout_ms
        );
    }
    Ok(())
}

/// Queue and consumer configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QueueSettings {
    /// SQLite database file; defaults to `<data dir>/queue.db`
    pub database_path: Option<PathBuf>,

    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Must exceed the longest realistic processing time
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,

    #[serde(default = "default_fetch_delay_ms")]
    pub fetch_delay_ms: u64,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Cap on concurrently running handlers; unbounded when absent
    #[serde(default)]
    pub max_in_flight: Option<usize>,

    #[serde(default = "default_slow_fetch_ms")]
    pub slow_fetch_ms: u64,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_queue_name() -> String {
    "messages".to_string()
}

fn default_lease_timeout_ms() -> u64 {
    20_000
}

fn default_fetch_delay_ms() -> u64 {
    100
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_slow_fetch_ms() -> u64 {
    1_000
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            queue_name: default_queue_name(),
            lease_timeout_ms: default_lease_timeout_ms(),
            fetch_delay_ms: default_fetch_delay_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            max_in_flight: None,
            slow_fetch_ms: default_slow_fetch_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl QueueSettings {
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("queue.db")),
        }
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn fetch_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn slow_fetch_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_fetch_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Logging configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LoggingSettings {
    /// Filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Emit JSON lines instead of text
    #[serde(default)]
    pub json: bool,

    /// Directory for the rolling log file; defaults to `<data dir>/logs`
    pub directory: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "info,lanequeue=debug".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
            directory: None,
        }
    }
}

/// lanequeue settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}
