//! Node configuration for sqlstats
//!
//! Handles loading and validation of `sqlstats.toml`. These are per-node
//! settings (where the database lives, how the scheduler polls); values
//! shared by the whole cluster live in [`crate::settings`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Job scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Schedule health reporting settings
    #[serde(default)]
    pub health: HealthConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for machines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file path
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// SQLite busy timeout in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("sqlstats.db")
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Job scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Identity this node uses when claiming due schedules
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// How often the scheduler looks for due schedules
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a claim on a running schedule is honoured by other nodes
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_ms: default_lease_ms(),
        }
    }
}

fn default_node_id() -> String {
    "node-1".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_lease_ms() -> u64 {
    5 * 60 * 1_000
}

/// Schedule health reporting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// How often the compaction schedule is reloaded and checked for anomalies
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// How often cluster settings are re-read to pick up changes made by other nodes
    #[serde(default = "default_settings_refresh_secs")]
    pub settings_refresh_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            settings_refresh_secs: default_settings_refresh_secs(),
        }
    }
}

fn default_check_interval_secs() -> u64 {
    300
}

fn default_settings_refresh_secs() -> u64 {
    10
}

impl SchedulerConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

impl HealthConfig {
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    #[must_use]
    pub fn settings_refresh(&self) -> Duration {
        Duration::from_secs(self.settings_refresh_secs)
    }
}

impl Config {
    /// Load configuration from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let display = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(display).into());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(display, e.to_string()))?;
        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(raw: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general
            .log_level
            .parse::<crate::logging::LogLevel>()
            .map_err(ConfigError::ValidationError)?;
        if self.storage.db_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.db_path must not be empty".into(),
            ));
        }
        if self.scheduler.node_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "scheduler.node_id must not be empty".into(),
            ));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.poll_interval_ms must be > 0".into(),
            ));
        }
        if self.scheduler.lease_ms == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.lease_ms must be > 0".into(),
            ));
        }
        if self.health.check_interval_secs == 0 || self.health.settings_refresh_secs == 0 {
            return Err(ConfigError::ValidationError(
                "health intervals must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Logging configuration derived from the `[general]` section
    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.general.log_level.clone(),
            format: self.general.log_format,
            file: self.general.log_file.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.scheduler.poll_interval_ms, 1_000);
        assert_eq!(config.storage.busy_timeout_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = Config::from_toml(
            r#"
            [general]
            log_format = "json"

            [scheduler]
            node_id = "node-7"
            "#,
        )
        .unwrap();
        assert_eq!(config.general.log_format, LogFormat::Json);
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.scheduler.node_id, "node-7");
        assert_eq!(config.scheduler.lease_ms, default_lease_ms());
        assert_eq!(config.health.check_interval(), Duration::from_secs(300));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = Config::from_toml("[scheduler]\npoll_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ValidationError(_))));

        let err = Config::from_toml("[general]\nlog_level = \"loud\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ValidationError(_))));

        let err = Config::from_toml("[general\n").unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ParseError(_))));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Config::load(Some(Path::new("/nonexistent/sqlstats.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::FileNotFound(_))));
        assert!(Config::load(None).is_ok());
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::Pretty.to_string(), "pretty");
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
